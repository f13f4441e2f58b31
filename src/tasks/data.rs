//! Test-input generation and validation.
//!
//! The data work group asks the task's generator for one input per
//! (test group, seed) pair, feeding it two arguments: the group name and a
//! hexadecimal seed. Seeds are derived deterministically from the task name,
//! so reruns regenerate byte-identical inputs and the result cache can skip
//! them. Two sanity probes guard the generator itself: rerunning one seed
//! must reproduce the input exactly, and two different seeds must not produce
//! the same input. When the task declares a validator, every generated input
//! is piped through it.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::env::{Env, EnvValue};
use crate::pipeline::{
    GroupContext, GroupWork, JobContext, JobOutput, JobWork, PipelineItem, RunOutcomeKind,
    WorkError,
};

use super::build::binary_path;
use super::process::ProgramRun;
use super::usage;

const DEFAULT_TESTS_PER_GROUP: i64 = 3;
const GENERATOR_TIME_LIMIT_MS: u64 = 60_000;

/// Derives the seed for one test deterministically from its identity.
pub fn derive_seed(task: &str, group: &str, index: usize) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    hasher.update(b"/");
    hasher.update(group.as_bytes());
    hasher.update(b"/");
    hasher.update(index.to_string().as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// File name of a generated input.
pub fn input_file_name(group: &str, seed: u32) -> String {
    format!("{group}_{seed:08x}.in")
}

fn run_generator(
    binary: &Path,
    group: &str,
    seed: u32,
    dest: &Path,
) -> Result<(), WorkError> {
    let outcome = ProgramRun::new(binary)
        .arg(group)
        .arg(format!("{seed:x}"))
        .stdout_file(dest)
        .time_limit_ms(GENERATOR_TIME_LIMIT_MS)
        .run()?;
    match outcome.kind {
        RunOutcomeKind::Ok => Ok(()),
        RunOutcomeKind::RuntimeError => Err(WorkError::failed(format!(
            "Generator failed on group '{group}' seed {seed:x} (exit {})",
            outcome.returncode
        ))),
        RunOutcomeKind::Timeout => Err(WorkError::failed(format!(
            "Generator timed out on group '{group}' seed {seed:x}"
        ))),
    }
}

/// Generates one test input.
pub struct GenerateInput {
    binary: PathBuf,
    group: String,
    seed: u32,
    dest: PathBuf,
}

impl JobWork for GenerateInput {
    fn kind(&self) -> &'static str {
        "generate"
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.group.clone(),
            format!("{:x}", self.seed),
            self.dest.display().to_string(),
        ]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.binary.clone()]
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        run_generator(&self.binary, &self.group, self.seed, &self.dest)?;
        // Stamp the generated input so a deleted file forces regeneration.
        ctx.access(self.dest.clone());
        Ok(JobOutput::Artifact {
            path: self.dest.clone(),
        })
    }
}

/// Reruns the generator with one already-used seed and demands a
/// byte-identical input.
pub struct GeneratorDeterminism {
    binary: PathBuf,
    group: String,
    seed: u32,
    reference: PathBuf,
}

impl JobWork for GeneratorDeterminism {
    fn kind(&self) -> &'static str {
        "check-determinism"
    }

    fn params(&self) -> Vec<String> {
        vec![self.group.clone(), format!("{:x}", self.seed)]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.binary.clone()]
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        let rerun = tempfile::NamedTempFile::new()
            .map_err(|err| WorkError::Internal(err.into()))?;
        run_generator(&self.binary, &self.group, self.seed, rerun.path())?;

        let first = ctx.read(&self.reference)?;
        let second = fs::read(rerun.path())?;
        if first != second {
            return Err(WorkError::failed(format!(
                "Generator is not deterministic: rerunning group '{}' seed {:x} produced a different input",
                self.group, self.seed
            )));
        }
        Ok(JobOutput::Unit)
    }
}

/// Demands that two differently-seeded inputs are not identical.
pub struct SeedsDiffer {
    first: PathBuf,
    second: PathBuf,
}

impl JobWork for SeedsDiffer {
    fn kind(&self) -> &'static str {
        "check-seeded"
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.first.display().to_string(),
            self.second.display().to_string(),
        ]
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        let first = ctx.read(&self.first)?;
        let second = ctx.read(&self.second)?;
        if first == second {
            return Err(WorkError::failed(
                "Generator ignores its seed: two differently-seeded inputs are identical",
            ));
        }
        Ok(JobOutput::Unit)
    }
}

/// Pipes one generated input through the task's validator.
pub struct ValidateInput {
    binary: PathBuf,
    group: String,
    input: PathBuf,
}

impl JobWork for ValidateInput {
    fn kind(&self) -> &'static str {
        "validate"
    }

    fn params(&self) -> Vec<String> {
        vec![self.group.clone(), self.input.display().to_string()]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.binary.clone(), self.input.clone()]
    }

    fn run(&mut self, _ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        let file = self
            .input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input.display().to_string());
        let outcome = ProgramRun::new(&self.binary)
            .arg(&self.group)
            .stdin_file(&self.input)
            .time_limit_ms(GENERATOR_TIME_LIMIT_MS)
            .run()?;
        match outcome.kind {
            RunOutcomeKind::Ok => Ok(JobOutput::Unit),
            RunOutcomeKind::RuntimeError => Err(WorkError::failed(format!(
                "Validator rejected '{file}' (exit {})",
                outcome.returncode
            ))),
            RunOutcomeKind::Timeout => {
                Err(WorkError::failed(format!("Validator timed out on '{file}'")))
            }
        }
    }
}

/// Generates, probes and validates every test input of the task.
pub struct DataGroup {
    build_dir: PathBuf,
    inputs_dir: PathBuf,
}

impl DataGroup {
    pub fn new(build_dir: PathBuf, inputs_dir: PathBuf) -> Self {
        DataGroup {
            build_dir,
            inputs_dir,
        }
    }
}

impl GroupWork for DataGroup {
    fn create_jobs(&mut self, env: &Env) -> Result<Vec<PipelineItem>, WorkError> {
        let task = env.get_str("name").map_err(usage)?.to_string();
        let generator = binary_path(
            &self.build_dir,
            Path::new(env.get_str("generator").map_err(usage)?),
        );
        let validator = match env.opt("validator") {
            Some(EnvValue::Str(source)) => {
                Some(binary_path(&self.build_dir, Path::new(source)))
            }
            Some(other) => {
                return Err(WorkError::failed(format!(
                    "Configuration key 'validator' is {}, expected a string",
                    other.type_name()
                )))
            }
            None => None,
        };
        let per_group = match env.opt("tests_per_group") {
            Some(EnvValue::Int(n)) if *n > 0 => *n,
            Some(EnvValue::Int(n)) => {
                return Err(WorkError::failed(format!(
                    "Configuration key 'tests_per_group' must be positive, got {n}"
                )))
            }
            Some(other) => {
                return Err(WorkError::failed(format!(
                    "Configuration key 'tests_per_group' is {}, expected an integer",
                    other.type_name()
                )))
            }
            None => DEFAULT_TESTS_PER_GROUP,
        };

        let mut groups = Vec::new();
        for value in env.get_list("test_groups").map_err(usage)? {
            let group = value.as_str().ok_or_else(|| {
                WorkError::failed("Each entry of 'test_groups' must be a string")
            })?;
            groups.push(group.to_string());
        }
        if groups.is_empty() {
            return Err(WorkError::failed("Configuration key 'test_groups' is empty"));
        }

        let mut items = Vec::new();
        let mut first_group_files = Vec::new();
        for group in &groups {
            for index in 0..per_group as usize {
                let seed = derive_seed(&task, group, index);
                let file = input_file_name(group, seed);
                let dest = self.inputs_dir.join(&file);
                let generate = format!("Generate {file}");

                items.push(PipelineItem::job(
                    generate.clone(),
                    GenerateInput {
                        binary: generator.clone(),
                        group: group.clone(),
                        seed,
                        dest: dest.clone(),
                    },
                ));

                if items.len() == 1 {
                    items.push(
                        PipelineItem::job(
                            format!("Check determinism on {file}"),
                            GeneratorDeterminism {
                                binary: generator.clone(),
                                group: group.clone(),
                                seed,
                                reference: dest.clone(),
                            },
                        )
                        .after(generate.clone()),
                    );
                }
                if group == &groups[0] {
                    first_group_files.push((generate.clone(), dest.clone()));
                }

                if let Some(validator) = &validator {
                    items.push(
                        PipelineItem::job(
                            format!("Validate {file}"),
                            ValidateInput {
                                binary: validator.clone(),
                                group: group.clone(),
                                input: dest,
                            },
                        )
                        .after(generate),
                    );
                }
            }
        }

        if first_group_files.len() >= 2 {
            let (first_job, first) = first_group_files[0].clone();
            let (second_job, second) = first_group_files[1].clone();
            items.push(
                PipelineItem::job("Check seeds differ", SeedsDiffer { first, second })
                    .after(first_job)
                    .after(second_job),
            );
        }

        Ok(items)
    }

    fn evaluate(&mut self, ctx: &GroupContext<'_>) -> Result<(), WorkError> {
        for child in ctx.children() {
            let Some(path) = ctx.output(child).and_then(|out| out.as_artifact()) else {
                continue;
            };
            let len = fs::metadata(path)
                .map_err(|err| WorkError::Internal(err.into()))?
                .len();
            if len == 0 {
                return Err(WorkError::failed(format!(
                    "Generated input '{}' is empty",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn status(&self, ctx: &GroupContext<'_>) -> Option<String> {
        Some(format!(
            "Generating inputs ({}/{})",
            ctx.terminal_count(),
            ctx.children().len()
        ))
    }
}
