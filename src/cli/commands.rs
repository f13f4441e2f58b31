//! CLI command definitions for taskcheck.
//!
//! Two commands: `test` runs the task's whole pipeline (build, generate,
//! validate, test solutions), `clean` wipes the per-task state directory.

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::env::Env;
use crate::pipeline::{Executor, ExecutorOptions};
use crate::storage::StateDir;
use crate::tasks::suite;

/// Task configuration file name, looked up in the task directory.
const CONFIG_FILE: &str = "task.yaml";

/// Correctness checker for algorithmic-contest task packages.
#[derive(Parser)]
#[command(name = "taskcheck")]
#[command(about = "Check the test data and solutions of a contest task")]
#[command(version)]
#[command(
    long_about = "taskcheck builds a task's programs, generates and validates its test inputs \
and runs every declared solution against the expected verdicts.\n\nResults are cached under \
.taskcheck/, so a rerun only redoes work whose inputs changed.\n\nExample usage:\n  \
taskcheck test path/to/task --full"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the task's test pipeline.
    Test(TestArgs),

    /// Remove the task's state directory (cache, builds, generated inputs).
    Clean(CleanArgs),
}

/// Arguments for `taskcheck test`.
#[derive(Parser, Debug)]
pub struct TestArgs {
    /// Task directory containing task.yaml.
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Keep going after the first failure and report everything found.
    #[arg(long)]
    pub full: bool,

    /// Disable live status lines (useful in CI logs).
    #[arg(long)]
    pub plain: bool,
}

/// Arguments for `taskcheck clean`.
#[derive(Parser, Debug)]
pub struct CleanArgs {
    /// Task directory containing task.yaml.
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli())
}

/// Runs the selected command with already-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Test(args) => run_test(args),
        Commands::Clean(args) => run_clean(args),
    }
}

fn load_config(task_dir: &Path) -> anyhow::Result<Env> {
    let path = task_dir.join(CONFIG_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("Cannot parse '{}'", path.display()))?;
    let env = Env::from_yaml(&value)
        .with_context(|| format!("Invalid configuration in '{}'", path.display()))?;
    Ok(env)
}

fn run_test(args: TestArgs) -> anyhow::Result<ExitCode> {
    let env = load_config(&args.path)?;
    let state = StateDir::open(&args.path)?;
    let _lock = state.lock()?;
    state.append_log(&format!("test started (full={})", args.full))?;

    let items = suite::build_pipeline(&env, &args.path, &state)?;
    let mut cache = ResultCache::open(state.cache_dir())?;
    let ansi = !args.plain && std::io::stdout().is_terminal();
    let mut executor = Executor::new(
        items,
        ExecutorOptions {
            full: args.full,
            ansi,
        },
    );
    let failed = executor.run(&env, &mut cache)?;

    let stats = cache.stats();
    debug!(
        hits = stats.hits,
        misses = stats.misses,
        "result cache statistics"
    );

    let mut env = env;
    env.lock();
    for key in env.unused_keys() {
        warn!(key = %key, "configuration key was never read");
    }

    if failed {
        state.append_log("test failed")?;
        println!("Some checks failed.");
        Ok(ExitCode::FAILURE)
    } else {
        state.append_log("test passed")?;
        println!("All checks passed.");
        Ok(ExitCode::SUCCESS)
    }
}

fn run_clean(args: CleanArgs) -> anyhow::Result<ExitCode> {
    if StateDir::clean(&args.path)? {
        println!("Removed state directory of '{}'.", args.path.display());
    } else {
        println!("Nothing to clean in '{}'.", args.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_test_command() {
        let cli = Cli::try_parse_from(["taskcheck", "test", "some/task", "--full", "--plain"])
            .unwrap();
        match cli.command {
            Commands::Test(args) => {
                assert_eq!(args.path, PathBuf::from("some/task"));
                assert!(args.full);
                assert!(args.plain);
            }
            _ => panic!("expected test command"),
        }
    }

    #[test]
    fn test_path_defaults_to_current_dir() {
        let cli = Cli::try_parse_from(["taskcheck", "clean"]).unwrap();
        match cli.command {
            Commands::Clean(args) => assert_eq!(args.path, PathBuf::from(".")),
            _ => panic!("expected clean command"),
        }
    }

    #[test]
    fn test_config_loading() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "name: sum\ngenerator: gen.cpp\ntest_groups: [\"01\"]\n",
        )
        .unwrap();

        let env = load_config(dir.path()).unwrap();
        assert_eq!(env.get_str("name").unwrap(), "sum");

        let missing = tempfile::tempdir().unwrap();
        assert!(load_config(missing.path()).is_err());
    }
}
