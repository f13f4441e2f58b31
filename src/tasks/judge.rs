//! Verdict assignment for one (solution, input) pair.
//!
//! A judge job always succeeds when the tooling works; the verdict it
//! produces is data for the solution group to evaluate. Timeouts and runtime
//! errors are read off the prerequisite run result; only a run that finished
//! normally has its output checked for correctness.

use std::path::PathBuf;

use crate::pipeline::{
    JobContext, JobOutput, JobWork, RunOutcomeKind, Verdict, WorkError,
};

use super::process::ProgramRun;

const CHECKER_TIME_LIMIT_MS: u64 = 60_000;

/// How a normally-finished run's output is checked.
pub enum JudgeMode {
    /// The primary solution defines correct output; finishing is enough.
    Trusted,
    /// Token-wise comparison against the primary solution's output.
    Compare { reference: PathBuf },
    /// External checker invoked as `checker <input> <correct> <output>`,
    /// exit 0 accepting and exit 1 rejecting.
    Checker { binary: PathBuf, reference: PathBuf },
}

impl JudgeMode {
    fn tag(&self) -> &'static str {
        match self {
            JudgeMode::Trusted => "trusted",
            JudgeMode::Compare { .. } => "compare",
            JudgeMode::Checker { .. } => "checker",
        }
    }
}

/// Whitespace-insensitive token equality, the classic output comparison.
pub fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    let a = String::from_utf8_lossy(a);
    let b = String::from_utf8_lossy(b);
    a.split_whitespace().eq(b.split_whitespace())
}

/// Judges one solution run, expected under the prerequisite alias `run`.
pub struct Judge {
    solution: String,
    input: PathBuf,
    mode: JudgeMode,
}

impl Judge {
    pub fn new(solution: impl Into<String>, input: PathBuf, mode: JudgeMode) -> Self {
        Judge {
            solution: solution.into(),
            input,
            mode,
        }
    }
}

impl JobWork for Judge {
    fn kind(&self) -> &'static str {
        "judge"
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.solution.clone(),
            self.input.display().to_string(),
            self.mode.tag().to_string(),
        ]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        match &self.mode {
            JudgeMode::Trusted => vec![self.input.clone()],
            JudgeMode::Compare { reference } => vec![self.input.clone(), reference.clone()],
            JudgeMode::Checker { binary, reference } => {
                vec![self.input.clone(), binary.clone(), reference.clone()]
            }
        }
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        let run = ctx
            .prerequisite("run")?
            .as_run()
            .ok_or_else(|| {
                WorkError::Internal(anyhow::anyhow!(
                    "Judge prerequisite is not a run result"
                ))
            })?
            .clone();

        let verdict = match run.kind {
            RunOutcomeKind::Timeout => Verdict::Timeout,
            RunOutcomeKind::RuntimeError => Verdict::RuntimeError,
            RunOutcomeKind::Ok => {
                let output = run.stdout.ok_or_else(|| {
                    WorkError::Internal(anyhow::anyhow!(
                        "Run result for '{}' has no captured output",
                        self.solution
                    ))
                })?;
                self.check_output(ctx, &output)?
            }
        };
        Ok(JobOutput::Verdict(verdict))
    }
}

impl Judge {
    fn check_output(
        &self,
        ctx: &mut JobContext<'_>,
        output: &PathBuf,
    ) -> Result<Verdict, WorkError> {
        match &self.mode {
            JudgeMode::Trusted => Ok(Verdict::Ok),
            JudgeMode::Compare { reference } => {
                let expected = ctx.read(reference)?;
                let actual = ctx.read(output)?;
                if tokens_match(&expected, &actual) {
                    Ok(Verdict::Ok)
                } else {
                    Ok(Verdict::WrongAnswer)
                }
            }
            JudgeMode::Checker { binary, reference } => {
                ctx.access(output);
                let outcome = ProgramRun::new(binary)
                    .arg(self.input.to_string_lossy())
                    .arg(reference.to_string_lossy())
                    .arg(output.to_string_lossy())
                    .time_limit_ms(CHECKER_TIME_LIMIT_MS)
                    .run()?;
                match (outcome.kind, outcome.returncode) {
                    (RunOutcomeKind::Ok, _) => Ok(Verdict::Ok),
                    (RunOutcomeKind::RuntimeError, 1) => Ok(Verdict::WrongAnswer),
                    (RunOutcomeKind::RuntimeError, code) => Err(WorkError::failed(format!(
                        "Checker failed on '{}' (exit {code})",
                        self.input.display()
                    ))),
                    (RunOutcomeKind::Timeout, _) => Err(WorkError::failed(format!(
                        "Checker timed out on '{}'",
                        self.input.display()
                    ))),
                }
            }
        }
    }
}
