//! Task-specific work: building programs, generating and validating test
//! inputs, running solutions and judging their outputs.
//!
//! Everything here plugs into the pipeline engine through the [`JobWork`]
//! and [`GroupWork`] traits; [`suite::build_pipeline`] assembles the whole
//! run for one task directory.
//!
//! [`JobWork`]: crate::pipeline::JobWork
//! [`GroupWork`]: crate::pipeline::GroupWork

pub mod build;
pub mod data;
pub mod judge;
pub mod process;
pub mod solution;
pub mod suite;

use crate::env::EnvError;
use crate::pipeline::WorkError;

/// A missing or mistyped configuration key is the author's mistake, not a
/// defect in the tool.
pub(crate) fn usage(err: EnvError) -> WorkError {
    WorkError::failed(err.to_string())
}
