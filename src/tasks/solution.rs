//! Per-solution testing.
//!
//! Each solution gets its own work group, expanded only after input
//! generation finished, which is when the inputs can be enumerated from
//! disk. Every input yields a run job and a judge job; the group's
//! `evaluate` hook then holds the verdict table against the solution's
//! declared expectation.

use std::fs;
use std::path::{Path, PathBuf};

use crate::env::{Env, EnvValue};
use crate::pipeline::{
    GroupContext, GroupWork, JobContext, JobOutput, JobWork, PipelineItem, Verdict, WorkError,
};

use super::build::binary_path;
use super::judge::{Judge, JudgeMode};
use super::process::ProgramRun;

const DEFAULT_TIME_LIMIT_MS: i64 = 5_000;

/// Runs one solution on one input under the task's time limit.
///
/// Exceeding the limit or crashing is a regular outcome here; the judge
/// decides what it means for the solution.
pub struct RunSolution {
    binary: PathBuf,
    input: PathBuf,
    output: PathBuf,
    time_limit_ms: u64,
}

impl JobWork for RunSolution {
    fn kind(&self) -> &'static str {
        "run-solution"
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.input.display().to_string(),
            self.output.display().to_string(),
            self.time_limit_ms.to_string(),
        ]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.binary.clone(), self.input.clone()]
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        let outcome = ProgramRun::new(&self.binary)
            .stdin_file(&self.input)
            .stdout_file(&self.output)
            .time_limit_ms(self.time_limit_ms)
            .run()?;
        // Stamp the captured output; judges of other solutions read it as the
        // reference, so it must be regenerated when it goes missing.
        ctx.access(self.output.clone());
        Ok(JobOutput::Run(outcome))
    }
}

/// Tests one solution on every generated input.
pub struct SolutionGroup {
    name: String,
    source: String,
    expected: Option<Verdict>,
    is_primary: bool,
    primary: String,
    build_dir: PathBuf,
    inputs_dir: PathBuf,
    outputs_dir: PathBuf,
}

impl SolutionGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        source: String,
        expected: Option<Verdict>,
        is_primary: bool,
        primary: String,
        build_dir: PathBuf,
        inputs_dir: PathBuf,
        outputs_dir: PathBuf,
    ) -> Self {
        SolutionGroup {
            name,
            source,
            expected,
            is_primary,
            primary,
            build_dir,
            inputs_dir,
            outputs_dir,
        }
    }

    /// Generated inputs, sorted by file name. Enumerated lazily so the group
    /// sees exactly what input generation produced.
    fn list_inputs(&self) -> Result<Vec<PathBuf>, WorkError> {
        let mut inputs = Vec::new();
        let entries = fs::read_dir(&self.inputs_dir)
            .map_err(|err| WorkError::Internal(anyhow::anyhow!(
                "Cannot list inputs in '{}': {err}",
                self.inputs_dir.display()
            )))?;
        for entry in entries {
            let path = entry
                .map_err(|err| WorkError::Internal(err.into()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "in") {
                inputs.push(path);
            }
        }
        inputs.sort();
        Ok(inputs)
    }

    fn judge_mode(&self, env: &Env, out_name: &str) -> Result<JudgeMode, WorkError> {
        if self.is_primary {
            return Ok(JudgeMode::Trusted);
        }
        let reference = self.outputs_dir.join(&self.primary).join(out_name);
        match env.opt("checker") {
            Some(EnvValue::Str(source)) => Ok(JudgeMode::Checker {
                binary: binary_path(&self.build_dir, Path::new(source)),
                reference,
            }),
            Some(other) => Err(WorkError::failed(format!(
                "Configuration key 'checker' is {}, expected a string",
                other.type_name()
            ))),
            None => Ok(JudgeMode::Compare { reference }),
        }
    }
}

impl GroupWork for SolutionGroup {
    fn create_jobs(&mut self, env: &Env) -> Result<Vec<PipelineItem>, WorkError> {
        let time_limit = match env.opt("time_limit_ms") {
            Some(EnvValue::Int(n)) if *n > 0 => *n,
            Some(EnvValue::Int(n)) => {
                return Err(WorkError::failed(format!(
                    "Configuration key 'time_limit_ms' must be positive, got {n}"
                )))
            }
            Some(other) => {
                return Err(WorkError::failed(format!(
                    "Configuration key 'time_limit_ms' is {}, expected an integer",
                    other.type_name()
                )))
            }
            None => DEFAULT_TIME_LIMIT_MS,
        };

        let inputs = self.list_inputs()?;
        if inputs.is_empty() {
            return Err(WorkError::failed(format!(
                "No test inputs found in '{}'",
                self.inputs_dir.display()
            )));
        }

        let binary = binary_path(&self.build_dir, Path::new(&self.source));
        let out_dir = self.outputs_dir.join(&self.name);
        fs::create_dir_all(&out_dir)?;

        let mut items = Vec::new();
        for input in inputs {
            let file = input
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| input.display().to_string());
            let out_name = format!("{}.out", file.trim_end_matches(".in"));

            let run_name = format!("Run {} on {file}", self.name);
            items.push(PipelineItem::job(
                run_name.clone(),
                RunSolution {
                    binary: binary.clone(),
                    input: input.clone(),
                    output: out_dir.join(&out_name),
                    time_limit_ms: time_limit as u64,
                },
            ));
            items.push(
                PipelineItem::job(
                    format!("Judge {} on {file}", self.name),
                    Judge::new(
                        self.name.clone(),
                        input,
                        self.judge_mode(env, &out_name)?,
                    ),
                )
                .after_as(run_name, "run"),
            );
        }
        Ok(items)
    }

    fn evaluate(&mut self, ctx: &GroupContext<'_>) -> Result<(), WorkError> {
        let mut verdicts = Vec::new();
        for child in ctx.children() {
            if let Some(verdict) = ctx.output(child).and_then(|out| out.as_verdict()) {
                verdicts.push((child.clone(), verdict));
            }
        }

        match self.expected {
            None | Some(Verdict::Ok) => {
                let wrong: Vec<String> = verdicts
                    .iter()
                    .filter(|(_, v)| *v != Verdict::Ok)
                    .map(|(name, v)| format!("{name}: {v}"))
                    .collect();
                if wrong.is_empty() {
                    Ok(())
                } else {
                    Err(WorkError::failed(format!(
                        "Solution '{}' should pass every test but got: {}",
                        self.name,
                        wrong.join(", ")
                    )))
                }
            }
            Some(expected) => {
                if verdicts.iter().any(|(_, v)| *v == expected) {
                    Ok(())
                } else {
                    let table: Vec<String> = verdicts
                        .iter()
                        .map(|(name, v)| format!("{name}: {v}"))
                        .collect();
                    Err(WorkError::failed(format!(
                        "Solution '{}' was expected to get {expected} at least once, but got: {}",
                        self.name,
                        table.join(", ")
                    )))
                }
            }
        }
    }

    fn status(&self, ctx: &GroupContext<'_>) -> Option<String> {
        Some(format!(
            "Testing {} ({}/{})",
            self.name,
            ctx.terminal_count(),
            ctx.children().len()
        ))
    }
}
