//! Work fingerprints.
//!
//! A fingerprint identifies a unit of work by its declared kind, constructor
//! parameters and the content of its declared input files. Two runs with
//! byte-identical inputs produce byte-identical fingerprints regardless of
//! scheduling order; nothing time- or process-dependent ever enters the hash.

use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::FileStamp;

/// SHA-256 of a byte slice, hex encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file's content, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Incremental fingerprint builder. Every field is written length-prefixed
/// under a label, so adjacent fields can never run into each other.
struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    fn new() -> Self {
        FingerprintBuilder {
            hasher: Sha256::new(),
        }
    }

    fn field(&mut self, label: &str, value: &str) {
        self.hasher.update(label.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Computes the fingerprint of a job from its declared identity, the
/// serialized results of its prerequisites (as `(lookup name, result)`
/// pairs, in declared order) and its input stamps. Stamps are sorted
/// internally, so the caller's ordering is irrelevant.
pub fn job_fingerprint(
    kind: &str,
    params: &[String],
    prerequisites: &[(String, String)],
    inputs: &[FileStamp],
) -> String {
    let mut builder = FingerprintBuilder::new();
    builder.field("kind", kind);
    for param in params {
        builder.field("param", param);
    }
    for (name, result) in prerequisites {
        builder.field("prereq", name);
        builder.field("result", result);
    }
    let mut sorted: Vec<&FileStamp> = inputs.iter().collect();
    sorted.sort();
    for stamp in sorted {
        builder.field("input", &stamp.path.to_string_lossy());
        builder.field("hash", &stamp.sha256);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn stamp(path: &str, hash: &str) -> FileStamp {
        FileStamp {
            path: PathBuf::from(path),
            sha256: hash.to_string(),
        }
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"1 2 3\n").unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"1 2 3\n"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let inputs = vec![stamp("a.in", "0011"), stamp("b.in", "2233")];
        let first = job_fingerprint("compile", &["gen.cpp".to_string()], &[], &inputs);
        let second = job_fingerprint("compile", &["gen.cpp".to_string()], &[], &inputs);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_ignores_input_order() {
        let forward = vec![stamp("a.in", "0011"), stamp("b.in", "2233")];
        let backward = vec![stamp("b.in", "2233"), stamp("a.in", "0011")];
        assert_eq!(
            job_fingerprint("generate", &[], &[], &forward),
            job_fingerprint("generate", &[], &[], &backward)
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_identity_and_content() {
        let inputs = vec![stamp("a.in", "0011")];
        let base = job_fingerprint("generate", &["1".to_string()], &[], &inputs);
        assert_ne!(
            base,
            job_fingerprint("validate", &["1".to_string()], &[], &inputs)
        );
        assert_ne!(base, job_fingerprint("generate", &["2".to_string()], &[], &inputs));
        assert_ne!(
            base,
            job_fingerprint("generate", &["1".to_string()], &[], &[stamp("a.in", "ffff")])
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_prerequisite_results() {
        let ok = vec![("run".to_string(), r#"{"kind":"ok"}"#.to_string())];
        let timeout = vec![("run".to_string(), r#"{"kind":"timeout"}"#.to_string())];
        let base = job_fingerprint("judge", &[], &ok, &[]);
        assert_ne!(base, job_fingerprint("judge", &[], &timeout, &[]));
        assert_ne!(base, job_fingerprint("judge", &[], &[], &[]));
    }

    #[test]
    fn test_fields_cannot_run_together() {
        // ("ab", "c") and ("a", "bc") must hash differently.
        assert_ne!(
            job_fingerprint("x", &["ab".to_string(), "c".to_string()], &[], &[]),
            job_fingerprint("x", &["a".to_string(), "bc".to_string()], &[], &[])
        );
    }
}
