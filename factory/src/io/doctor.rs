//! Doctor: scans lock files for stale owners (process no longer alive) and reports them.
//!
//! Grounded in `original_source/tools/codex/factory/locks.py`'s stale-lock note: a lock file
//! whose recorded `pid` no longer exists is a candidate for manual or explicit removal, never
//! silent cleanup.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::io::lock::ledger_lock_path;
use crate::io::util::read_json;

#[derive(Debug, Clone, Serialize)]
pub struct LockCandidate {
    pub path: PathBuf,
    pub owner: String,
    pub pid: Option<u64>,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub stale: Vec<LockCandidate>,
    pub healthy: Vec<LockCandidate>,
    pub removed: Vec<PathBuf>,
}

#[cfg(unix)]
fn pid_is_alive(pid: u64) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u64) -> bool {
    true
}

fn inspect_lock_file(path: &Path) -> Option<LockCandidate> {
    let value: Value = read_json(path).ok()?;
    let owner = value.get("owner")?.as_str().unwrap_or("").to_string();
    let pid = value.get("pid").and_then(Value::as_u64);
    let alive = pid.map(pid_is_alive).unwrap_or(true);
    Some(LockCandidate { path: path.to_path_buf(), owner, pid, alive })
}

fn iter_lock_files(runs_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(run_entries) = std::fs::read_dir(runs_dir) else { return files };
    for run_entry in run_entries.flatten() {
        let locks_dir = run_entry.path().join("locks");
        let Ok(lock_entries) = std::fs::read_dir(&locks_dir) else { continue };
        for lock_entry in lock_entries.flatten() {
            let path = lock_entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lock") {
                files.push(path);
            }
        }
    }
    let ledger_lock = ledger_lock_path(runs_dir);
    if ledger_lock.exists() {
        files.push(ledger_lock);
    }
    files.sort();
    files
}

/// Scans every lock file under `runs_dir` (per-run `locks/` directories plus the ledger lock)
/// and classifies each by whether its recorded owning PID is still alive. Never deletes unless
/// `remove_stale` is set.
pub fn run_doctor(runs_dir: &Path, remove_stale: bool) -> Result<DoctorReport> {
    let mut stale = Vec::new();
    let mut healthy = Vec::new();
    let mut removed = Vec::new();

    for path in iter_lock_files(runs_dir) {
        let Some(candidate) = inspect_lock_file(&path) else { continue };
        if candidate.alive {
            healthy.push(candidate);
        } else {
            if remove_stale {
                let _ = std::fs::remove_file(&candidate.path);
                removed.push(candidate.path.clone());
            }
            stale.push(candidate);
        }
    }

    Ok(DoctorReport { stale, healthy, removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::util::write_json;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn reports_stale_lock_for_dead_pid() {
        let runs_dir = tempdir().unwrap();
        let lock_path = runs_dir.path().join("run-1").join("locks").join("run.lock");
        write_json(&lock_path, &json!({"owner": "tester", "pid": 999_999_999u64})).unwrap();

        let report = run_doctor(runs_dir.path(), false).unwrap();
        assert_eq!(report.stale.len(), 1);
        assert!(report.removed.is_empty());
        assert!(lock_path.exists());
    }

    #[test]
    fn remove_stale_deletes_dead_lock() {
        let runs_dir = tempdir().unwrap();
        let lock_path = runs_dir.path().join("run-1").join("locks").join("run.lock");
        write_json(&lock_path, &json!({"owner": "tester", "pid": 999_999_999u64})).unwrap();

        let report = run_doctor(runs_dir.path(), true).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!lock_path.exists());
    }

    #[test]
    fn current_process_lock_is_healthy() {
        let runs_dir = tempdir().unwrap();
        let lock_path = runs_dir.path().join("run-1").join("locks").join("run.lock");
        write_json(&lock_path, &json!({"owner": "tester", "pid": crate::io::util::current_pid()})).unwrap();

        let report = run_doctor(runs_dir.path(), false).unwrap();
        assert_eq!(report.healthy.len(), 1);
    }
}
