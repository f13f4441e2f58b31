//! Program compilation.
//!
//! The build work group turns every program the task configuration names
//! (generator, validator, checker, solutions) into an executable under the
//! state directory's `build/` dir. C and C++ sources go through `gcc`/`g++`;
//! anything else is treated as an already-runnable script and copied with the
//! execute bit set.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::env::Env;
use crate::pipeline::{
    GroupContext, GroupWork, JobContext, JobOutput, JobWork, PipelineItem, WorkError,
};

use super::usage;

/// Executable path a source file compiles to.
pub fn binary_path(build_dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string());
    build_dir.join(stem)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Compiles (or copies) one source file into an executable.
pub struct Compile {
    source: PathBuf,
    output: PathBuf,
}

impl Compile {
    pub fn new(source: PathBuf, output: PathBuf) -> Self {
        Compile { source, output }
    }

    fn compiler(&self) -> Option<(&'static str, Vec<&'static str>)> {
        let ext = self
            .source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        match ext.as_deref() {
            Some("c") => Some(("gcc", vec!["-O2", "-std=c11"])),
            Some("cpp") | Some("cc") | Some("cxx") => Some(("g++", vec!["-O2", "-std=c++17"])),
            _ => None,
        }
    }
}

impl JobWork for Compile {
    fn kind(&self) -> &'static str {
        "compile"
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.source.display().to_string(),
            self.output.display().to_string(),
        ]
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.source.clone()]
    }

    fn run(&mut self, ctx: &mut JobContext<'_>) -> Result<JobOutput, WorkError> {
        if !self.source.is_file() {
            return Err(WorkError::failed(format!(
                "Source file '{}' does not exist",
                self.source.display()
            )));
        }

        match self.compiler() {
            Some((compiler, flags)) => {
                let result = Command::new(compiler)
                    .args(&flags)
                    .arg(&self.source)
                    .arg("-o")
                    .arg(&self.output)
                    .output()
                    .map_err(|err| {
                        WorkError::Internal(anyhow::anyhow!("Cannot run {compiler}: {err}"))
                    })?;
                if !result.status.success() {
                    let stderr = String::from_utf8_lossy(&result.stderr);
                    return Err(WorkError::failed(format!(
                        "Compilation of '{}' failed:\n{}",
                        file_name(&self.source),
                        stderr.trim_end()
                    )));
                }
            }
            None => {
                fs::copy(&self.source, &self.output)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&self.output, fs::Permissions::from_mode(0o755))?;
                }
            }
        }

        // Stamp the produced executable: if it disappears, the cached hit
        // becomes invalid and the compile re-runs.
        ctx.access(self.output.clone());
        Ok(JobOutput::Artifact {
            path: self.output.clone(),
        })
    }
}

/// Builds every program the configuration mentions, each exactly once.
pub struct BuildGroup {
    task_dir: PathBuf,
    build_dir: PathBuf,
}

impl BuildGroup {
    pub fn new(task_dir: PathBuf, build_dir: PathBuf) -> Self {
        BuildGroup {
            task_dir,
            build_dir,
        }
    }

    fn sources(&self, env: &Env) -> Result<Vec<PathBuf>, WorkError> {
        let mut sources = Vec::new();
        sources.push(env.get_str("generator").map_err(usage)?.to_string());
        for key in ["validator", "checker"] {
            if let Some(value) = env.opt(key) {
                let path = value.as_str().ok_or_else(|| {
                    WorkError::failed(format!("Configuration key '{key}' must be a string"))
                })?;
                sources.push(path.to_string());
            }
        }
        for solution in env.get_list("solutions").map_err(usage)? {
            let solution = solution
                .as_env()
                .ok_or_else(|| WorkError::failed("Each solution must be a mapping"))?;
            sources.push(solution.get_str("source").map_err(usage)?.to_string());
        }

        let mut seen = BTreeSet::new();
        Ok(sources
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .map(|s| self.task_dir.join(s))
            .collect())
    }
}

impl GroupWork for BuildGroup {
    fn create_jobs(&mut self, env: &Env) -> Result<Vec<PipelineItem>, WorkError> {
        let mut items = Vec::new();
        for source in self.sources(env)? {
            let output = binary_path(&self.build_dir, &source);
            items.push(PipelineItem::job(
                format!("Compile {}", file_name(&source)),
                Compile::new(source, output),
            ));
        }
        Ok(items)
    }

    fn status(&self, ctx: &GroupContext<'_>) -> Option<String> {
        Some(format!(
            "Compiling programs ({}/{})",
            ctx.terminal_count(),
            ctx.children().len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvValue;
    use crate::pipeline::ResultRegistry;

    fn run_compile(job: &mut Compile) -> Result<JobOutput, WorkError> {
        let registry = ResultRegistry::new();
        let mut ctx = JobContext::new(&registry, &[]);
        job.run(&mut ctx)
    }

    #[test]
    fn test_script_is_copied_executable() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("gen.sh");
        fs::write(&source, "#!/bin/sh\necho 1\n").unwrap();
        let output = dir.path().join("gen");

        let result = run_compile(&mut Compile::new(source, output.clone())).unwrap();
        assert_eq!(result.as_artifact(), Some(&output));
        assert!(output.is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&output).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Compile::new(dir.path().join("absent.cpp"), dir.path().join("absent"));
        assert!(matches!(run_compile(&mut job), Err(WorkError::Failed(_))));
    }

    #[test]
    fn test_compiler_selection() {
        let c = Compile::new(PathBuf::from("gen.c"), PathBuf::from("gen"));
        assert_eq!(c.compiler().unwrap().0, "gcc");
        let cpp = Compile::new(PathBuf::from("solve.cpp"), PathBuf::from("solve"));
        assert_eq!(cpp.compiler().unwrap().0, "g++");
        let sh = Compile::new(PathBuf::from("gen.sh"), PathBuf::from("gen"));
        assert!(sh.compiler().is_none());
    }

    #[test]
    fn test_group_deduplicates_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = Env::new();
        env.set("generator", EnvValue::Str("gen.cpp".into()));
        env.set("checker", EnvValue::Str("check.cpp".into()));
        let mut solution = Env::new();
        solution.set("name", EnvValue::Str("solve".into()));
        solution.set("source", EnvValue::Str("solve.cpp".into()));
        let mut slow = Env::new();
        slow.set("name", EnvValue::Str("slow".into()));
        slow.set("source", EnvValue::Str("solve.cpp".into()));
        env.set(
            "solutions",
            EnvValue::List(vec![EnvValue::Nested(solution), EnvValue::Nested(slow)]),
        );

        let mut group = BuildGroup::new(dir.path().to_path_buf(), dir.path().join("build"));
        let items = group.create_jobs(&env).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.clone()).collect();
        assert_eq!(
            names,
            vec!["Compile gen.cpp", "Compile check.cpp", "Compile solve.cpp"]
        );
    }

    #[test]
    fn test_group_requires_generator() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = Env::new();
        env.set("solutions", EnvValue::List(vec![]));
        let mut group = BuildGroup::new(dir.path().to_path_buf(), dir.path().join("build"));
        assert!(matches!(
            group.create_jobs(&env),
            Err(WorkError::Failed(_))
        ));
    }
}
