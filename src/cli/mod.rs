//! Command-line interface for taskcheck.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, CleanArgs, Commands, TestArgs};
