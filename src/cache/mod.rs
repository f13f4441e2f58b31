//! Persistent, content-addressed result cache.
//!
//! Maps a work fingerprint to a previously computed result together with a
//! manifest of content hashes for every file the producing job accessed. A
//! hit is only served when every manifested hash still matches the file on
//! disk; anything else re-runs the job.
//!
//! Entries are stored as one JSON file per fingerprint under the internal
//! state directory, sharded by the first two hex characters. Removing the
//! directory forces a full recompute of every entry. Only successful results
//! are memoized; failures always re-run.

mod fingerprint;

pub use fingerprint::{hash_bytes, hash_file, job_fingerprint};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::pipeline::{JobContext, JobOutput, JobWork, WorkError};

/// Default bound on the number of retained entries.
const MAX_ENTRIES: usize = 2048;

/// Storage faults of the cache itself. These are internal errors, never
/// per-job failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist cache entry '{fingerprint}': {message}")]
    Persist { fingerprint: String, message: String },
}

/// A file's identity at the time a job ran.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileStamp {
    pub path: PathBuf,
    pub sha256: String,
}

impl FileStamp {
    /// Whether the file still has the recorded content.
    fn still_matches(&self) -> bool {
        matches!(hash_file(&self.path), Ok(hash) if hash == self.sha256)
    }
}

/// One cached result with its access manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub kind: String,
    pub result: JobOutput,
    /// Sorted, deduplicated stamps of every file the job accessed.
    pub manifest: Vec<FileStamp>,
    /// Bookkeeping for eviction; never part of the fingerprint.
    pub last_used: DateTime<Utc>,
}

impl CacheEntry {
    /// A hit is valid only while every manifested hash matches disk.
    fn is_valid(&self) -> bool {
        self.manifest.iter().all(FileStamp::still_matches)
    }
}

/// Hit/miss counters for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// What `export` kept and dropped.
#[derive(Debug, Clone, Copy)]
pub struct ExportStats {
    pub kept: usize,
    pub dropped: usize,
}

/// The persistent result cache, shared across runs.
pub struct ResultCache {
    dir: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
    limit: usize,
    stats: CacheStats,
}

impl ResultCache {
    /// Opens (or creates) the cache under `dir`, loading every stored entry.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::with_limit(dir, MAX_ENTRIES)
    }

    /// Opens the cache with an explicit entry bound.
    pub fn with_limit(dir: impl Into<PathBuf>, limit: usize) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut entries = BTreeMap::new();
        for file in WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(path).map_err(CacheError::from).and_then(|data| {
                serde_json::from_slice::<CacheEntry>(&data).map_err(CacheError::from)
            }) {
                Ok(entry) => {
                    let expected = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                    if entry.fingerprint == expected {
                        entries.insert(entry.fingerprint.clone(), entry);
                    } else {
                        warn!(path = %path.display(), "cache entry under wrong name, dropping");
                        let _ = fs::remove_file(path);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable cache entry, dropping");
                    let _ = fs::remove_file(path);
                }
            }
        }

        debug!(entries = entries.len(), dir = %dir.display(), "opened result cache");
        Ok(ResultCache {
            dir,
            entries,
            limit,
            stats: CacheStats::default(),
        })
    }

    /// Hit/miss counters accumulated during this run.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the memoized result for `work`, or runs it.
    ///
    /// The fingerprint is computed from the work's declared kind, parameters,
    /// the results of its prerequisites and its input files. On a miss (or an
    /// invalidated hit) the work function runs, every file it accessed is
    /// stamped, and the fresh result is persisted before being returned.
    pub fn lookup_or_run(
        &mut self,
        name: &str,
        work: &mut dyn JobWork,
        ctx: &mut JobContext<'_>,
    ) -> Result<JobOutput, WorkError> {
        let mut stamps = Vec::new();
        for path in work.inputs() {
            let sha256 = hash_file(&path).map_err(|err| {
                WorkError::failed(format!("Cannot read input '{}': {err}", path.display()))
            })?;
            stamps.push(FileStamp { path, sha256 });
        }
        let mut prereq_results = Vec::new();
        for (lookup_name, output) in ctx.prerequisite_outputs() {
            let json = serde_json::to_string(output).map_err(|err| {
                WorkError::Internal(anyhow!(
                    "Cannot serialize result of prerequisite '{lookup_name}': {err}"
                ))
            })?;
            prereq_results.push((lookup_name.to_string(), json));
        }
        let fingerprint =
            job_fingerprint(work.kind(), &work.params(), &prereq_results, &stamps);

        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            if entry.is_valid() {
                entry.last_used = Utc::now();
                self.stats.hits += 1;
                debug!(job = name, fingerprint = %fingerprint, "cache hit");
                return Ok(entry.result.clone());
            }
            debug!(job = name, "cache entry stale, re-running");
        }

        self.stats.misses += 1;
        let result = work.run(ctx)?;

        let mut manifest = stamps;
        for path in ctx.accessed() {
            let sha256 = hash_file(path).map_err(|err| {
                WorkError::Internal(anyhow!(
                    "Cannot hash accessed file '{}': {err}",
                    path.display()
                ))
            })?;
            manifest.push(FileStamp {
                path: path.clone(),
                sha256,
            });
        }
        manifest.sort();
        manifest.dedup();

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            kind: work.kind().to_string(),
            result: result.clone(),
            manifest,
            last_used: Utc::now(),
        };
        self.write_entry(&entry)
            .map_err(|err| WorkError::Internal(anyhow!("Cannot store cache entry: {err}")))?;
        self.entries.insert(fingerprint, entry);
        Ok(result)
    }

    /// End-of-run maintenance: drops entries whose backing files no longer
    /// exist, bounds growth by last-used eviction, and rewrites the directory
    /// to exactly the retained set (removing duplicates and strays).
    pub fn export(&mut self) -> Result<ExportStats, CacheError> {
        let before = self.entries.len();

        self.entries
            .retain(|_, entry| entry.manifest.iter().all(|stamp| stamp.path.exists()));

        if self.entries.len() > self.limit {
            let mut by_age: Vec<(DateTime<Utc>, String)> = self
                .entries
                .iter()
                .map(|(fingerprint, entry)| (entry.last_used, fingerprint.clone()))
                .collect();
            by_age.sort();
            let excess = by_age.len() - self.limit;
            for (_, fingerprint) in by_age.into_iter().take(excess) {
                self.entries.remove(&fingerprint);
            }
        }

        // Rewrite the directory to the retained set.
        for file in WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let stem = file.path().file_stem().and_then(|s| s.to_str());
            if !stem.is_some_and(|s| self.entries.contains_key(s)) {
                let _ = fs::remove_file(file.path());
            }
        }
        for entry in self.entries.values() {
            self.write_entry(entry)?;
        }
        // Shard directories left empty can go.
        for dir in fs::read_dir(&self.dir)?.filter_map(Result::ok) {
            if dir.path().is_dir() {
                let _ = fs::remove_dir(dir.path());
            }
        }

        let kept = self.entries.len();
        Ok(ExportStats {
            kept,
            dropped: before - kept,
        })
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        let shard = &fingerprint[0..2.min(fingerprint.len())];
        self.dir.join(shard).join(format!("{fingerprint}.json"))
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.fingerprint);
        let shard = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(shard)?;

        let mut tmp = tempfile::NamedTempFile::new_in(shard)?;
        tmp.write_all(&serde_json::to_vec_pretty(entry)?)?;
        tmp.persist(&path).map_err(|err| CacheError::Persist {
            fingerprint: entry.fingerprint.clone(),
            message: err.to_string(),
        })?;
        Ok(())
    }
}
