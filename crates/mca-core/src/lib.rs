use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write-to-temp-then-rename so readers never observe a partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// serde_json keeps object keys sorted, so serializing a Value is already a
/// canonical form.
pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(value.to_string().as_bytes())
}

/// Identity triple for one trial: perturbation level, backend mode, trial
/// index. Levels and modes are caller-supplied strings substituted verbatim
/// into names and patterns; no validation is performed on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub level: String,
    pub mode: String,
    pub trial: u32,
}

impl RunIdentity {
    pub fn new(level: &str, mode: &str, trial: u32) -> Self {
        Self {
            level: level.to_string(),
            mode: mode.to_string(),
            trial,
        }
    }

    pub fn log_file_name(&self) -> String {
        format!("log.{}.{}.{}", self.level, self.mode, self.trial)
    }

    pub fn log_path(&self, results_dir: &Path) -> PathBuf {
        results_dir.join(self.log_file_name())
    }

    pub fn run_state_file_name(&self) -> String {
        format!("run_state.{}.{}.json", self.level, self.mode)
    }

    pub fn manifest_file_name(&self) -> String {
        format!("manifest.{}.{}.json", self.level, self.mode)
    }

    pub fn analysis_file_name(&self) -> String {
        format!("analysis.{}.{}.json", self.level, self.mode)
    }
}

/// Backend config files are named by convention from the mode identifier.
pub fn backend_file_name(mode: &str) -> String {
    format!("vfc_backends.{}.txt", mode)
}

pub fn backend_file_path(backends_dir: &Path, mode: &str) -> PathBuf {
    backends_dir.join(backend_file_name(mode))
}

/// The glob string an image reference expands to, for display and manifests.
pub fn image_glob_pattern(image_dir: &Path, prefix: &str, level: &str) -> String {
    format!("{}/{}-{}*.sif", image_dir.display(), prefix, level)
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image directory unreadable: {dir}: {source}")]
    DirUnreadable {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("no container image matches {pattern}")]
    NoMatch { pattern: String },
    #[error("ambiguous image pattern {pattern}: matches {candidates:?}")]
    Ambiguous {
        pattern: String,
        candidates: Vec<String>,
    },
}

/// Expand `{prefix}-{level}*.sif` over the image directory. Zero matches and
/// multiple matches are both hard errors: the policy is fail fast, never
/// first-match.
pub fn resolve_image(image_dir: &Path, prefix: &str, level: &str) -> Result<PathBuf, ImageError> {
    let pattern = image_glob_pattern(image_dir, prefix, level);
    let stem = format!("{}-{}", prefix, level);
    let entries = fs::read_dir(image_dir).map_err(|source| ImageError::DirUnreadable {
        dir: image_dir.to_path_buf(),
        source,
    })?;
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&stem) && name.ends_with(".sif") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    match matches.len() {
        0 => Err(ImageError::NoMatch { pattern }),
        1 => Ok(matches.remove(0)),
        _ => Err(ImageError::Ambiguous {
            pattern,
            candidates: matches
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mca_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn log_path_encodes_all_identity_components() {
        let id = RunIdentity::new("3", "rr", 7);
        assert_eq!(
            id.log_path(Path::new("results")),
            PathBuf::from("results/log.3.rr.7")
        );
    }

    #[test]
    fn distinct_trials_yield_distinct_log_paths() {
        let results = Path::new("results");
        let a = RunIdentity::new("3", "rr", 1).log_path(results);
        let b = RunIdentity::new("3", "rr", 2).log_path(results);
        assert_ne!(a, b);
    }

    #[test]
    fn glob_pattern_is_deterministic() {
        let p1 = image_glob_pattern(Path::new("/containers"), "pyafq-fuzzy", "3");
        let p2 = image_glob_pattern(Path::new("/containers"), "pyafq-fuzzy", "3");
        assert_eq!(p1, p2);
        assert_eq!(p1, "/containers/pyafq-fuzzy-3*.sif");
    }

    #[test]
    fn backend_file_path_is_deterministic() {
        let a = backend_file_path(Path::new("/AFQ/backends"), "rr");
        let b = backend_file_path(Path::new("/AFQ/backends"), "rr");
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/AFQ/backends/vfc_backends.rr.txt"));
    }

    #[test]
    fn resolve_image_picks_single_match() {
        let dir = scratch_dir("single");
        fs::write(dir.join("pyafq-fuzzy-3-20240115.sif"), b"").expect("image");
        fs::write(dir.join("pyafq-fuzzy-11-20240115.sif"), b"").expect("other level");
        fs::write(dir.join("notes.txt"), b"").expect("noise");
        let resolved = resolve_image(&dir, "pyafq-fuzzy", "3").expect("resolve");
        assert_eq!(resolved, dir.join("pyafq-fuzzy-3-20240115.sif"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resolve_image_fails_fast_on_zero_matches() {
        let dir = scratch_dir("none");
        let err = resolve_image(&dir, "pyafq-fuzzy", "3").expect_err("no match");
        assert!(matches!(err, ImageError::NoMatch { .. }), "got {err}");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resolve_image_fails_fast_on_ambiguity() {
        let dir = scratch_dir("ambiguous");
        fs::write(dir.join("pyafq-fuzzy-3-a.sif"), b"").expect("image a");
        fs::write(dir.join("pyafq-fuzzy-3-b.sif"), b"").expect("image b");
        let err = resolve_image(&dir, "pyafq-fuzzy", "3").expect_err("ambiguous");
        match err {
            ImageError::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity error, got {other}"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = scratch_dir("atomic");
        let path = dir.join("state.json");
        atomic_write_bytes(&path, b"first").expect("write");
        atomic_write_bytes(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }
}
