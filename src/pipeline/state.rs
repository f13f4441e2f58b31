//! Pipeline item states.

use serde::{Deserialize, Serialize};

/// State of a pipeline item.
///
/// Transitions: `Pending -> Running -> {Succeeded, Failed}` and
/// `Pending -> Canceled` when a declared prerequisite ended `Failed` or
/// `Canceled`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Queued, not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure message.
    Failed,
    /// Never ran because a prerequisite did not succeed.
    Canceled,
}

impl State {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Canceled)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Pending => write!(f, "pending"),
            State::Running => write!(f, "running"),
            State::Succeeded => write!(f, "succeeded"),
            State::Failed => write!(f, "failed"),
            State::Canceled => write!(f, "canceled"),
        }
    }
}
