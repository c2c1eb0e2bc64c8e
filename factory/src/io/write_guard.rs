//! Write Guard: a capability bound to one allowed root, used everywhere the factory writes
//! worker/integrator artifacts so a bug elsewhere can never write outside a run's own directory.
//!
//! Grounded on the original `fs_guard.py`: `validate_path` rejects anything not equal to or
//! nested under the allowed root; every write goes through that check first.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::io::util::deep_sort_json;

#[derive(Debug, Clone)]
pub struct WriteGuard {
    allowed_root: PathBuf,
}

impl WriteGuard {
    /// `allowed_root` need not exist yet; it is resolved lazily on first validation.
    pub fn new(allowed_root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: allowed_root.into(),
        }
    }

    pub fn allowed_root(&self) -> &Path {
        &self.allowed_root
    }

    /// Confirms `target` is the allowed root or nested under it. Both paths are compared
    /// lexically (post-`..`-normalization via [`Path::components`]) rather than via
    /// [`Path::canonicalize`], so this works for targets that don't exist yet.
    pub fn validate_path(&self, target: &Path) -> Result<PathBuf> {
        let normalized_target = normalize(target);
        let normalized_root = normalize(&self.allowed_root);
        if normalized_target == normalized_root || normalized_target.starts_with(&normalized_root)
        {
            return Ok(normalized_target);
        }
        bail!(
            "write policy violation: attempted write outside run root; target={} allowed_root={}",
            normalized_target.display(),
            normalized_root.display()
        );
    }

    fn ensure_parent(&self, target: &Path) -> Result<PathBuf> {
        let resolved = self.validate_path(target)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        Ok(resolved)
    }

    pub fn write_text(&self, target: &Path, text: &str) -> Result<PathBuf> {
        let resolved = self.ensure_parent(target)?;
        let mut normalized = text.replace("\r\n", "\n");
        if !normalized.ends_with('\n') {
            normalized.push('\n');
        }
        fs::write(&resolved, normalized.as_bytes())
            .with_context(|| format!("write {}", resolved.display()))?;
        Ok(resolved)
    }

    pub fn write_json(&self, target: &Path, payload: &Value) -> Result<PathBuf> {
        let sorted = deep_sort_json(payload);
        let mut rendered = serde_json::to_string_pretty(&sorted)
            .with_context(|| format!("serialize json for {}", target.display()))?;
        rendered.push('\n');
        self.write_text(target, &rendered)
    }

    pub fn append_line(&self, target: &Path, line: &str) -> Result<PathBuf> {
        let resolved = self.ensure_parent(target)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .with_context(|| format!("open {} for append", resolved.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append to {}", resolved.display()))?;
        Ok(resolved)
    }
}

/// Lexically normalizes `..`/`.` segments without touching the filesystem, so non-existent
/// targets can still be validated against the allowed root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allows_write_within_root() {
        let dir = tempdir().unwrap();
        let guard = WriteGuard::new(dir.path());
        let path = dir.path().join("STATUS.json");
        guard.write_text(&path, "hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn rejects_write_outside_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let guard = WriteGuard::new(dir.path());
        let result = guard.write_text(&outside.path().join("evil.txt"), "nope");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_traversal_back_out_of_root() {
        let dir = tempdir().unwrap();
        let guard = WriteGuard::new(dir.path());
        let escape = dir.path().join("../escape.txt");
        assert!(guard.write_text(&escape, "nope").is_err());
    }

    #[test]
    fn write_json_sorts_keys_and_appends_newline() {
        let dir = tempdir().unwrap();
        let guard = WriteGuard::new(dir.path());
        let path = dir.path().join("out.json");
        guard
            .write_json(&path, &serde_json::json!({"b": 1, "a": 2}))
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn append_line_creates_file_and_accumulates() {
        let dir = tempdir().unwrap();
        let guard = WriteGuard::new(dir.path());
        let path = dir.path().join("LOG.txt");
        guard.append_line(&path, "one").unwrap();
        guard.append_line(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
