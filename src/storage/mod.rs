//! On-disk state for a task directory.
//!
//! Everything the tool writes lives under a single `.taskcheck/` directory
//! inside the task: the result cache, compiled binaries, generated inputs,
//! solution outputs and the append-only run log. Deleting the directory
//! resets the tool without touching the author's files.

mod lock;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

pub use lock::RunLock;

/// Name of the per-task state directory.
pub const STATE_DIR_NAME: &str = ".taskcheck";

/// Errors raised while managing the state directory.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to prepare state directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another run holds the task lock (pid {pid})")]
    Locked { pid: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to a task's `.taskcheck/` directory. Creating it lays out all
/// subdirectories the pipeline writes into.
#[derive(Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Opens (and if needed creates) the state directory for `task_dir`.
    pub fn open(task_dir: &Path) -> Result<Self, StorageError> {
        let root = task_dir.join(STATE_DIR_NAME);
        let state = StateDir { root };
        for dir in [
            state.root.clone(),
            state.cache_dir(),
            state.build_dir(),
            state.inputs_dir(),
            state.outputs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| StorageError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(state)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the result cache keeps its entries.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Where compiled program binaries land.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Where generated test inputs land.
    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join("inputs")
    }

    /// Where solution outputs land, one subdirectory per solution.
    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("runs.log")
    }

    /// Takes the task lock, failing if another run already holds it.
    pub fn lock(&self) -> Result<RunLock, StorageError> {
        RunLock::acquire(self.lock_path())
    }

    /// Appends one timestamped line to the run log.
    pub fn append_log(&self, line: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)?;
        Ok(())
    }

    /// Removes the whole state directory.
    pub fn clean(task_dir: &Path) -> Result<bool, StorageError> {
        let root = task_dir.join(STATE_DIR_NAME);
        if root.is_dir() {
            fs::remove_dir_all(&root)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();

        assert!(state.cache_dir().is_dir());
        assert!(state.build_dir().is_dir());
        assert!(state.inputs_dir().is_dir());
        assert!(state.outputs_dir().is_dir());
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        StateDir::open(dir.path()).unwrap();
        StateDir::open(dir.path()).unwrap();
    }

    #[test]
    fn test_append_log_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::open(dir.path()).unwrap();
        state.append_log("test started").unwrap();
        state.append_log("test finished").unwrap();

        let log = fs::read_to_string(state.root().join("runs.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().next().unwrap().ends_with("test started"));
    }

    #[test]
    fn test_clean_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        StateDir::open(dir.path()).unwrap();

        assert!(StateDir::clean(dir.path()).unwrap());
        assert!(!dir.path().join(STATE_DIR_NAME).exists());
        assert!(!StateDir::clean(dir.path()).unwrap());
    }
}
