//! Worktree Manager (C7): creates and verifies one isolated git worktree per worker.
//!
//! This component's responsibility ends at `git worktree add`/verify and recording what
//! happened; the OS-specific GUI launcher that opens editor sessions on each worktree is out of
//! scope. Grounded on the `create_worktrees`/`verify_worktrees` slice of the original
//! `worktrees.py`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::core::types::Status;
use crate::io::git::Git;
use crate::io::lock::{acquire_run_lock, acquire_worker_lock};
use crate::io::util::write_json;

pub fn worktree_root(worktrees_dir: &Path) -> PathBuf {
    worktrees_dir.to_path_buf()
}

pub fn worktree_path(worktrees_dir: &Path, worker: &str) -> PathBuf {
    worktrees_dir.join(worker)
}

pub fn branch_name(branch_prefix: &str, worker: &str) -> String {
    format!("{branch_prefix}/{worker}")
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeStep {
    pub worker: String,
    pub status: Status,
    pub detail: String,
    pub path: PathBuf,
    pub base_ref_commit: String,
    pub worktree_commit: Option<String>,
    pub commit_match: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeCreateResult {
    pub run_id: String,
    pub status: Status,
    pub steps: Vec<WorktreeStep>,
    pub blocked: usize,
    pub lock_errors: Vec<String>,
    pub base_ref: String,
    pub base_ref_commit: String,
}

/// Creates (or reuses, if already present and on the right commit) one detached worktree per
/// worker under `worktrees_dir`. Each worker's creation is individually lock-guarded so a failure
/// on one worker cannot corrupt another's worktree state.
pub fn create_worktrees(
    repo: &Git,
    runs_dir: &Path,
    worktrees_dir: &Path,
    run_id: &str,
    owner: &str,
    workers: &[&str],
    base_ref: &str,
) -> Result<WorktreeCreateResult> {
    std::fs::create_dir_all(worktree_root(worktrees_dir))?;
    let base_ref_commit = repo.rev_parse(base_ref)?;

    let run_lock = acquire_run_lock(runs_dir, run_id, owner);
    let mut lock_errors = Vec::new();
    if let Err(err) = &run_lock {
        lock_errors.push(err.to_string());
        let steps: Vec<WorktreeStep> = workers
            .iter()
            .map(|w| WorktreeStep {
                worker: w.to_string(),
                status: Status::Blocked,
                detail: "run lock unavailable".to_string(),
                path: worktree_path(worktrees_dir, w),
                base_ref_commit: base_ref_commit.clone(),
                worktree_commit: None,
                commit_match: false,
            })
            .collect();
        let blocked = steps.len();
        return Ok(WorktreeCreateResult {
            run_id: run_id.to_string(),
            status: Status::Blocked,
            steps,
            blocked,
            lock_errors,
            base_ref: base_ref.to_string(),
            base_ref_commit,
        });
    }
    let _run_lock = run_lock.expect("checked above");

    let mut steps = Vec::new();
    for worker in workers {
        let target = worktree_path(worktrees_dir, worker);
        let worker_lock = acquire_worker_lock(runs_dir, run_id, worker, owner);
        if let Err(err) = worker_lock {
            lock_errors.push(err.to_string());
            steps.push(WorktreeStep {
                worker: worker.to_string(),
                status: Status::Blocked,
                detail: err.to_string(),
                path: target,
                base_ref_commit: base_ref_commit.clone(),
                worktree_commit: None,
                commit_match: false,
            });
            continue;
        }
        let _worker_lock = worker_lock.expect("checked above");

        if target.exists() {
            let is_worktree = target.join(".git").exists();
            let worktree_commit = if is_worktree {
                Git::new(&target).rev_parse("HEAD").ok()
            } else {
                None
            };
            let commit_match = worktree_commit.as_deref() == Some(base_ref_commit.as_str());
            steps.push(WorktreeStep {
                worker: worker.to_string(),
                status: if is_worktree { Status::Pass } else { Status::Blocked },
                detail: if is_worktree {
                    "worktree already exists".to_string()
                } else {
                    "path exists but is not a git worktree".to_string()
                },
                path: target,
                base_ref_commit: base_ref_commit.clone(),
                worktree_commit,
                commit_match,
            });
            continue;
        }

        let add_result = repo.worktree_add_detached(&target, base_ref);
        let (status, detail, worktree_commit, commit_match) = match add_result {
            Ok(()) => {
                let commit = Git::new(&target).rev_parse("HEAD").ok();
                let matched = commit.as_deref() == Some(base_ref_commit.as_str());
                if matched {
                    (Status::Pass, "created".to_string(), commit, true)
                } else {
                    (
                        Status::Blocked,
                        "created but commit mismatch".to_string(),
                        commit,
                        false,
                    )
                }
            }
            Err(err) => (Status::Blocked, err.to_string(), None, false),
        };
        steps.push(WorktreeStep {
            worker: worker.to_string(),
            status,
            detail,
            path: target,
            base_ref_commit: base_ref_commit.clone(),
            worktree_commit,
            commit_match,
        });
    }

    let blocked = steps.iter().filter(|s| s.status != Status::Pass).count();
    let overall = if blocked == 0 { Status::Pass } else { Status::Blocked };
    let result = WorktreeCreateResult {
        run_id: run_id.to_string(),
        status: overall,
        steps,
        blocked,
        lock_errors,
        base_ref: base_ref.to_string(),
        base_ref_commit,
    };
    let state_path = runs_dir.join(run_id).join("WORKTREE_STATE.json");
    write_json(&state_path, &serde_json::to_value(&result)?)?;
    Ok(result)
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyStep {
    pub worker: String,
    pub status: Status,
    pub path: PathBuf,
    pub commit: Option<String>,
}

/// Confirms each worker's worktree still exists and is a real git worktree (has a `.git` entry
/// and resolves `HEAD`). Does not compare against the run's recorded base commit — a worker is
/// expected to have committed on top of it by the time this runs.
pub fn verify_worktrees(worktrees_dir: &Path, workers: &[&str]) -> Vec<VerifyStep> {
    workers
        .iter()
        .map(|worker| {
            let target = worktree_path(worktrees_dir, worker);
            let ok = target.exists() && target.join(".git").exists();
            let commit = if ok {
                Git::new(&target).rev_parse("HEAD").ok()
            } else {
                None
            };
            VerifyStep {
                worker: worker.to_string(),
                status: if ok && commit.is_some() {
                    Status::Pass
                } else {
                    Status::Blocked
                },
                path: target,
                commit,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStep {
    pub worker: String,
    pub status: Status,
    pub detail: String,
    pub path: PathBuf,
}

/// Fetches and prunes remote refs inside each worker's worktree and confirms `HEAD` still
/// resolves. Does not merge or rebase — a worker's own commits are left untouched.
pub fn sync_worktrees(worktrees_dir: &Path, workers: &[&str]) -> Vec<SyncStep> {
    workers
        .iter()
        .map(|worker| {
            let target = worktree_path(worktrees_dir, worker);
            if !target.exists() {
                return SyncStep {
                    worker: worker.to_string(),
                    status: Status::Blocked,
                    detail: "worktree does not exist".to_string(),
                    path: target,
                };
            }
            let repo = Git::new(&target);
            let fetch_ok = repo.fetch_all_prune().unwrap_or(false);
            let head_ok = repo.rev_parse("HEAD").is_ok();
            let status = if fetch_ok && head_ok { Status::Pass } else { Status::Blocked };
            SyncStep {
                worker: worker.to_string(),
                status,
                detail: if status == Status::Pass {
                    "synced".to_string()
                } else {
                    "sync failed".to_string()
                },
                path: target,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    pub status: Status,
    pub known_paths: Vec<PathBuf>,
    pub unknown_paths: Vec<PathBuf>,
    pub count: usize,
    pub max_allowed: usize,
}

/// Lists every entry directly under `worktrees_dir` and fails if any path is not one of the
/// known workers' fixed slots, or if there are more entries than workers expected.
pub fn check_worktree_invariant(worktrees_dir: &Path, workers: &[&str]) -> Result<InvariantReport> {
    let known: Vec<PathBuf> = workers.iter().map(|w| worktree_path(worktrees_dir, w)).collect();
    if !worktrees_dir.exists() {
        return Ok(InvariantReport {
            status: Status::Pass,
            known_paths: known,
            unknown_paths: Vec::new(),
            count: 0,
            max_allowed: workers.len(),
        });
    }

    let mut unknown_paths = Vec::new();
    let mut count = 0usize;
    for entry in std::fs::read_dir(worktrees_dir)? {
        let entry = entry?;
        let path = entry.path();
        count += 1;
        if !known.contains(&path) {
            unknown_paths.push(path);
        }
    }

    let status = if unknown_paths.is_empty() && count <= workers.len() {
        Status::Pass
    } else {
        Status::Blocked
    };
    Ok(InvariantReport { status, known_paths: known, unknown_paths, count, max_allowed: workers.len() })
}

#[derive(Debug, Clone, Serialize)]
pub struct EditorSession {
    pub worker: String,
    pub pid: u32,
    pub command: String,
    pub launched_at: String,
}

/// Launches the configured editor command against each worker's worktree and records
/// `{worker, pid, command, launched_at}` to a session registry file. Does not wait for the
/// editor to exit, and does not attempt window management or session cleanup.
pub fn open_worktrees(
    runs_dir: &Path,
    worktrees_dir: &Path,
    run_id: &str,
    workers: &[&str],
    editor_command: &str,
) -> Result<Vec<EditorSession>> {
    let mut sessions = Vec::new();
    for worker in workers {
        let target = worktree_path(worktrees_dir, worker);
        let child = std::process::Command::new(editor_command)
            .arg(&target)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Ok(child) = child {
            sessions.push(EditorSession {
                worker: worker.to_string(),
                pid: child.id(),
                command: editor_command.to_string(),
                launched_at: crate::io::util::iso_utc_now(),
            });
        }
    }
    let registry_path = runs_dir.join(run_id).join("_debug").join("EDITOR_SESSIONS.json");
    write_json(&registry_path, &serde_json::to_value(&sessions)?)?;
    Ok(sessions)
}
