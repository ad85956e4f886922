//! Small filesystem and hashing helpers shared across phases.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write JSON atomically: temp file in the target directory, flush,
/// fsync, rename. The temp file is removed on any failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(data).context("Failed to serialize JSON")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(serialized.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.flush()?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;
        Ok(())
    })();
    if result.is_err() && tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Load a JSON file, or `None` when missing or unparseable.
pub fn load_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// Hex SHA-256 of a string.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.json");
        atomic_write_json(&path, &json!({"ok": true})).unwrap();
        atomic_write_json(&path, &json!({"ok": false})).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["artifact.json".to_string()]);
        assert_eq!(load_json(&path).unwrap()["ok"], json!(false));
    }

    #[test]
    fn load_json_missing_is_none() {
        assert!(load_json(Path::new("/nonexistent/x.json")).is_none());
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(sha256_hex("prd"), sha256_hex("prd"));
        assert_eq!(sha256_hex("prd").len(), 64);
    }
}
