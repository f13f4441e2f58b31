//! The incremental job-pipeline engine.
//!
//! This module contains the dependency-ordered unit-of-work scheduler at the
//! heart of the tool:
//!
//! - [`PipelineItem`]: a job or a lazily expanded work group
//! - [`State`]: the per-item state machine
//! - [`Executor`]: the strictly sequential queue driver
//! - [`JobOutput`]: the result values jobs produce and the cache memoizes
//!
//! Items exist for one executor run; the result cache and the environment
//! context outlive it and are passed in explicitly.

mod executor;
mod item;
mod outcome;
mod state;
mod status;

pub use executor::{Executor, ExecutorOptions, ExecutorState, PipelineError};
pub use item::{
    FinishedItem, GroupContext, GroupWork, ItemWork, JobContext, JobWork, PipelineItem,
    Prerequisite, ResultRegistry, WorkError,
};
pub use outcome::{JobOutput, RunOutcome, RunOutcomeKind, Verdict};
pub use state::State;
pub use status::StatusRenderer;
