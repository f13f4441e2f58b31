//! Result values produced by jobs.
//!
//! Every job ends in exactly one [`JobOutput`]: the exit outcome of a program
//! it ran, a judged verdict, a generated artifact descriptor, or nothing
//! beyond success. Outputs are serialized into the result cache, so they must
//! describe artifacts by deterministic paths, never by in-memory handles.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a program execution ended. A program that finished normally but
/// produced a wrong answer still gets [`RunOutcomeKind::Ok`]; correctness is
/// judged separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcomeKind {
    /// Exited with status zero.
    Ok,
    /// Exited with a non-zero status or was killed by a signal.
    RuntimeError,
    /// Killed after exceeding its wall-clock limit.
    Timeout,
}

/// Outcome of running an external program once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub kind: RunOutcomeKind,
    /// Raw exit code, `-1` when the process was killed by a signal.
    pub returncode: i32,
    /// Wall-clock runtime in milliseconds.
    pub time_ms: u64,
    /// File the program's standard output was captured into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
}

impl RunOutcome {
    pub fn ok(time_ms: u64) -> Self {
        RunOutcome {
            kind: RunOutcomeKind::Ok,
            returncode: 0,
            time_ms,
            stdout: None,
        }
    }

    pub fn runtime_error(returncode: i32, time_ms: u64) -> Self {
        RunOutcome {
            kind: RunOutcomeKind::RuntimeError,
            returncode,
            time_ms,
            stdout: None,
        }
    }

    pub fn timeout(time_ms: u64) -> Self {
        RunOutcome {
            kind: RunOutcomeKind::Timeout,
            returncode: -1,
            time_ms,
            stdout: None,
        }
    }

    /// Attaches the captured-stdout path.
    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }
}

/// Verdict for one (solution, input) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Ok,
    WrongAnswer,
    RuntimeError,
    Timeout,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Ok => write!(f, "ok"),
            Verdict::WrongAnswer => write!(f, "wrong-answer"),
            Verdict::RuntimeError => write!(f, "runtime-error"),
            Verdict::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Verdict::Ok),
            "wrong-answer" => Ok(Verdict::WrongAnswer),
            "runtime-error" => Ok(Verdict::RuntimeError),
            "timeout" => Ok(Verdict::Timeout),
            other => Err(format!(
                "Unknown verdict '{other}' (expected ok, wrong-answer, runtime-error or timeout)"
            )),
        }
    }
}

/// The single result value a job produces once terminal.
///
/// Adjacently tagged: internal tagging cannot carry the string-encoded
/// `Verdict` payload, and its tag would collide with [`RunOutcome`]'s own
/// `kind` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobOutput {
    /// Success with no payload.
    Unit,
    /// A file produced at a deterministic path.
    Artifact { path: PathBuf },
    /// Outcome of running a program.
    Run(RunOutcome),
    /// A judged verdict.
    Verdict(Verdict),
}

impl JobOutput {
    pub fn as_run(&self) -> Option<&RunOutcome> {
        match self {
            JobOutput::Run(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn as_verdict(&self) -> Option<Verdict> {
        match self {
            JobOutput::Verdict(verdict) => Some(*verdict),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&PathBuf> {
        match self {
            JobOutput::Artifact { path } => Some(path),
            _ => None,
        }
    }
}
