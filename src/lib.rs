//! taskcheck: correctness checker for algorithmic-contest task packages.
//!
//! This library builds a task's programs, generates and validates its test
//! inputs and runs every declared solution, all through an incremental,
//! result-cached job pipeline.

// Core modules
pub mod cache;
pub mod cli;
pub mod env;
pub mod pipeline;
pub mod storage;
pub mod tasks;

// Re-export commonly used types
pub use cache::{CacheError, ResultCache};
pub use env::{Env, EnvError, EnvValue};
pub use pipeline::{Executor, ExecutorOptions, PipelineError, PipelineItem, State, Verdict};
pub use storage::{StateDir, StorageError};
