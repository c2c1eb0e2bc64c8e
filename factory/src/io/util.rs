//! Shared filesystem and formatting helpers used across the I/O layer.
//!
//! Every artifact the factory writes is LF-only, UTF-8, and ends with a trailing newline, and
//! every JSON document is written with sorted keys so two runs over identical inputs produce
//! byte-identical files. This mirrors `common.py`'s `write_text`/`write_json`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Current UTC instant. Centralized so tests can be written against fixed clocks later.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// RFC 3339 timestamp with millisecond precision and a literal `Z` suffix.
pub fn iso_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn iso_utc_now() -> String {
    iso_utc(now_utc())
}

/// Compact timestamp suitable for run-id components: `YYYYMMDDTHHMMSSZ`.
pub fn compact_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Writes `text` verbatim, normalizing line endings to LF and appending a trailing newline if
/// one is not already present. Uses a temp-file-then-rename so readers never observe a partial
/// write.
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut normalized = text.replace("\r\n", "\n");
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    let tmp_name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => format!("{name}.tmp"),
        None => "write.tmp".to_string(),
    };
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, normalized.as_bytes())
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename into place {}", path.display()))?;
    Ok(())
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Writes `value` as pretty-printed, key-sorted JSON with a trailing newline.
pub fn write_json(path: &Path, value: &Value) -> Result<()> {
    let sorted = deep_sort_json(value);
    let mut buf = serde_json::to_string_pretty(&sorted)
        .with_context(|| format!("serialize json for {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}

pub fn read_json(path: &Path) -> Result<Value> {
    let text = read_text(path)?;
    serde_json::from_str(&text).with_context(|| format!("parse json {}", path.display()))
}

/// Recursively sorts object keys so serialization is deterministic regardless of insertion
/// order. Arrays are left in place; callers sort list contents explicitly where order carries
/// meaning (see `core::overlap` and `core::run_id`).
pub fn deep_sort_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), deep_sort_json(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(deep_sort_json).collect()),
        other => other.clone(),
    }
}

pub fn stable_sha256_text(text: &str) -> String {
    stable_sha256_bytes(text.as_bytes())
}

pub fn stable_sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(stable_sha256_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_text_appends_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_text(&path, "hello").unwrap();
        assert_eq!(read_text(&path).unwrap(), "hello\n");
    }

    #[test]
    fn write_text_normalizes_crlf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_text(&path, "a\r\nb\r\n").unwrap();
        assert_eq!(read_text(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn deep_sort_json_orders_object_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}});
        let sorted = deep_sort_json(&value);
        let rendered = serde_json::to_string(&sorted).unwrap();
        assert_eq!(rendered, r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn stable_sha256_is_deterministic() {
        assert_eq!(stable_sha256_text("abc"), stable_sha256_text("abc"));
        assert_ne!(stable_sha256_text("abc"), stable_sha256_text("abd"));
    }

    #[test]
    fn write_json_round_trips_through_read_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        let value = serde_json::json!({"z": 1, "a": 2});
        write_json(&path, &value).unwrap();
        let text = read_text(&path).unwrap();
        assert!(text.starts_with('{'));
        assert!(text.ends_with("}\n"));
        let back = read_json(&path).unwrap();
        assert_eq!(back, value);
    }
}
