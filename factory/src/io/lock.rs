//! Lock Manager: atomic exclusive-create file locks for runs, workers, and the ledger.
//!
//! A lock is a file created with `O_CREAT | O_EXCL`, so creation itself is the atomic test for
//! "do I hold this lock". Lock files carry enough metadata (owner, pid, timestamp) to diagnose a
//! stale lock by hand; they are not reentrant and not poisoned on panic, matching the teacher's
//! guard files under `io/guards.rs`.

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::io::util::{current_pid, iso_utc_now};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An acquired lock file. Releases (deletes the lock file) when dropped.
pub struct FileLock {
    path: PathBuf,
    acquired: bool,
}

impl FileLock {
    /// Acquires the lock immediately, failing if another holder already owns it.
    pub fn acquire(path: &Path, owner: &str, metadata: &serde_json::Value) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("lock already held: {}", path.display()))?;
        let payload = json!({
            "owner": owner,
            "pid": current_pid(),
            "ts_utc": iso_utc_now(),
            "metadata": metadata,
        });
        let mut buf = serde_json::to_string(&sorted(&payload))?;
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write lock payload {}", path.display()))?;
        Ok(FileLock {
            path: path.to_path_buf(),
            acquired: true,
        })
    }

    /// Retries acquisition until `timeout` elapses, polling at a fixed interval.
    pub fn acquire_with_timeout(
        path: &Path,
        owner: &str,
        metadata: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Self> {
        let start = Instant::now();
        loop {
            match Self::acquire(path, owner, metadata) {
                Ok(lock) => return Ok(lock),
                Err(err) => {
                    if start.elapsed() >= timeout {
                        bail!("lock timeout after {:?}: {}", timeout, err);
                    }
                    sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Releases the lock early. Idempotent; dropping an already-released lock is a no-op.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.acquired {
            return;
        }
        let _ = fs::remove_file(&self.path);
        self.acquired = false;
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn sorted(value: &serde_json::Value) -> serde_json::Value {
    serde_json::from_str(&serde_json::to_string(value).unwrap_or_default())
        .unwrap_or(serde_json::Value::Null)
}

/// Directory holding every lock file for a run.
pub fn run_locks_dir(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id).join("locks")
}

pub fn run_lock_path(runs_dir: &Path, run_id: &str) -> PathBuf {
    run_locks_dir(runs_dir, run_id).join("run.lock")
}

pub fn worker_lock_path(runs_dir: &Path, run_id: &str, worker: &str) -> PathBuf {
    run_locks_dir(runs_dir, run_id).join(format!("{worker}.lock"))
}

pub fn acquire_run_lock(runs_dir: &Path, run_id: &str, owner: &str) -> Result<FileLock> {
    FileLock::acquire(
        &run_lock_path(runs_dir, run_id),
        owner,
        &json!({ "run_id": run_id }),
    )
}

pub fn acquire_worker_lock(
    runs_dir: &Path,
    run_id: &str,
    worker: &str,
    owner: &str,
) -> Result<FileLock> {
    FileLock::acquire(
        &worker_lock_path(runs_dir, run_id, worker),
        owner,
        &json!({ "run_id": run_id, "worker": worker }),
    )
}

/// Ledger writers share a single global lock since the ledger file itself is process-wide.
pub fn ledger_lock_path(runs_dir: &Path) -> PathBuf {
    runs_dir.join("factory_ledger.lock")
}

pub fn acquire_ledger_lock(runs_dir: &Path, owner: &str) -> Result<FileLock> {
    FileLock::acquire_with_timeout(
        &ledger_lock_path(runs_dir),
        owner,
        &json!({}),
        Duration::from_secs(5),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let lock = FileLock::acquire(&path, "tester", &json!({})).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
        let _second = FileLock::acquire(&path, "tester", &json!({})).unwrap();
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.lock");
        let _first = FileLock::acquire(&path, "tester", &json!({})).unwrap();
        assert!(FileLock::acquire(&path, "tester", &json!({})).is_err());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.lock");
        {
            let _lock = FileLock::acquire(&path, "tester", &json!({})).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn timeout_acquire_gives_up_past_deadline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let _held = FileLock::acquire(&path, "tester", &json!({})).unwrap();
        let result =
            FileLock::acquire_with_timeout(&path, "tester", &json!({}), Duration::from_millis(120));
        assert!(result.is_err());
    }

    #[test]
    fn run_and_worker_lock_paths_are_distinct() {
        let runs_dir = PathBuf::from("/runs");
        assert_ne!(
            run_lock_path(&runs_dir, "run1"),
            worker_lock_path(&runs_dir, "run1", "A_worker")
        );
    }
}
