//! Exclusive task lock.
//!
//! One run per task directory at a time. The lock is a file created with
//! `create_new`, which is atomic on every platform we care about; the file
//! holds the owner's pid for diagnostics. Dropping the guard releases the
//! lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use tracing::warn;

use super::StorageError;

/// Guard owning the task lock file. The lock is released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Attempts to create the lock file. Fails with [`StorageError::Locked`]
    /// if it already exists.
    pub fn acquire(path: PathBuf) -> Result<Self, StorageError> {
        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match created {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(RunLock { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let pid = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(StorageError::Locked { pid })
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to release task lock");
        }
    }
}
