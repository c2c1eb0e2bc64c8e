//! Launches worker agent subprocesses in parallel and waits for their DONE markers.
//!
//! Grounded in `original_source/tools/codex/dispatch/dispatch_prompts.py` (hard-timeout
//! computation, heartbeat cadence, TIMEOUT_REPORT) and `validator.py::wait_for_done_markers`
//! (marker polling and exact-token matching), adapted from Windows/AutoHotkey window automation
//! to plain subprocess launch since this crate targets headless worker agents rather than GUI
//! automation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};

use crate::core::types::Status;
use crate::io::config::DispatchConfig;
use crate::io::util::{iso_utc_now, write_json};

const PER_WORKER_ACTION_SECONDS: u64 = 50;
const HARD_TIMEOUT_MIN_SECONDS: u64 = 180;
const HARD_TIMEOUT_MAX_SECONDS: u64 = 7200;
const HARD_TIMEOUT_BUFFER_SECONDS: u64 = 30;

fn heartbeat_path(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id).join("_debug").join("DISPATCH_HEARTBEAT.json")
}

fn timeout_report_path(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id).join("_debug").join("TIMEOUT_REPORT.json")
}

fn done_marker_path(runs_dir: &Path, run_id: &str, worker: &str) -> PathBuf {
    runs_dir.join(run_id).join(worker).join("DONE.marker")
}

fn done_token(run_id: &str, worker: &str) -> String {
    format!("DONE {run_id} {worker}")
}

/// Computes the outer hard timeout: proportional to worker count, clamped to a sane range.
pub fn compute_hard_timeout_seconds(config: &DispatchConfig, worker_count: usize) -> u64 {
    let per_worker = (config.window_ready_timeout_seconds as u64 + config.readiness_timeout_seconds as u64 + PER_WORKER_ACTION_SECONDS).max(60);
    let computed = (worker_count.max(1) as u64 * per_worker) + HARD_TIMEOUT_BUFFER_SECONDS;
    computed.clamp(HARD_TIMEOUT_MIN_SECONDS, HARD_TIMEOUT_MAX_SECONDS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptFileCheck {
    pub worker: String,
    pub path: PathBuf,
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct PromptValidation {
    pub status: Status,
    pub errors: Vec<String>,
    pub files: Vec<PromptFileCheck>,
}

fn prompt_file_name(run_id: &str, worker: &str) -> String {
    format!("{worker}_{run_id}.txt")
}

/// Validates that every worker has a non-empty prompt file under `prompts_dir/<run_id>/`.
pub fn validate_prompt_folder(prompts_dir: &Path, run_id: &str, workers: &[&str]) -> PromptValidation {
    let prompt_dir = prompts_dir.join(run_id);
    let mut errors = Vec::new();
    let mut files = Vec::new();

    if !prompt_dir.exists() {
        errors.push(format!("prompt folder is missing: {}", prompt_dir.display()));
    }

    for worker in workers {
        let path = prompt_dir.join(prompt_file_name(run_id, worker));
        let present = path.is_file() && std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if !present {
            errors.push(format!("missing or empty prompt file for {worker}: {}", path.display()));
        }
        files.push(PromptFileCheck { worker: worker.to_string(), path, present });
    }

    let status = if errors.is_empty() { Status::Pass } else { Status::Blocked };
    PromptValidation { status, errors, files }
}

fn write_heartbeat(runs_dir: &Path, run_id: &str, workers: &[&str], seq: &mut u64, state: &str, last_step: &str) -> Result<()> {
    *seq += 1;
    write_json(
        &heartbeat_path(runs_dir, run_id),
        &json!({
            "run_id": run_id,
            "stage": "dispatch",
            "seq": *seq,
            "state": state,
            "last_step": last_step,
            "workers": workers,
        }),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerDoneStatus {
    pub worker: String,
    pub marker: PathBuf,
    pub status: Status,
    pub content_ok: bool,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub run_id: String,
    pub status: Status,
    pub errors: Vec<String>,
    pub workers: Vec<WorkerDoneStatus>,
    pub hard_timeout_seconds: u64,
    pub duration_seconds: f64,
    pub timed_out: bool,
}

fn substitute(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn spawn_worker(
    config: &DispatchConfig,
    run_id: &str,
    worker: &str,
    worktree_path: &Path,
    prompt_path: &Path,
) -> Result<Child> {
    let mut vars = BTreeMap::new();
    vars.insert("run_id", run_id.to_string());
    vars.insert("worker", worker.to_string());
    vars.insert("worktree", worktree_path.display().to_string());
    vars.insert("prompt", prompt_path.display().to_string());
    let rendered = substitute(&config.worker_launch_command, &vars);

    let mut parts = rendered.split_whitespace();
    let program = parts.next().context("worker_launch_command is empty")?;
    let mut cmd = Command::new(program);
    cmd.args(parts);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    cmd.spawn().with_context(|| format!("spawn worker launcher for {worker}"))
}

/// Launches every worker's agent process in parallel and polls for DONE markers until all are
/// present, the configured timeout elapses, or prompt validation fails before launch.
pub fn dispatch_workers(
    runs_dir: &Path,
    prompts_dir: &Path,
    worktrees_dir: &Path,
    run_id: &str,
    workers: &[&str],
    config: &DispatchConfig,
) -> Result<DispatchResult> {
    let mut seq = 0u64;
    write_heartbeat(runs_dir, run_id, workers, &mut seq, "STARTING", "validate_prompt_folder")?;

    let validation = validate_prompt_folder(prompts_dir, run_id, workers);
    if validation.status != Status::Pass {
        write_heartbeat(runs_dir, run_id, workers, &mut seq, "BLOCKED", "prompt_validation_failed")?;
        return Ok(DispatchResult {
            run_id: run_id.to_string(),
            status: Status::Blocked,
            errors: validation.errors,
            workers: Vec::new(),
            hard_timeout_seconds: compute_hard_timeout_seconds(config, workers.len()),
            duration_seconds: 0.0,
            timed_out: false,
        });
    }

    if config.worker_launch_command.trim().is_empty() {
        write_heartbeat(runs_dir, run_id, workers, &mut seq, "BLOCKED", "missing_launch_command")?;
        return Ok(DispatchResult {
            run_id: run_id.to_string(),
            status: Status::Blocked,
            errors: vec!["dispatch.worker_launch_command is not configured".to_string()],
            workers: Vec::new(),
            hard_timeout_seconds: compute_hard_timeout_seconds(config, workers.len()),
            duration_seconds: 0.0,
            timed_out: false,
        });
    }

    let hard_timeout_seconds = compute_hard_timeout_seconds(config, workers.len());
    let start = Instant::now();
    let deadline = start + Duration::from_secs(hard_timeout_seconds);

    write_heartbeat(runs_dir, run_id, workers, &mut seq, "RUNNING", "launch_workers")?;
    let mut children: Vec<(String, Child)> = Vec::new();
    let mut launch_errors = Vec::new();
    for worker in workers {
        let worktree_path = worktrees_dir.join(worker);
        let prompt_path = prompts_dir.join(run_id).join(prompt_file_name(run_id, worker));
        match spawn_worker(config, run_id, worker, &worktree_path, &prompt_path) {
            Ok(child) => children.push((worker.to_string(), child)),
            Err(err) => launch_errors.push(format!("{worker}: {err}")),
        }
        std::thread::sleep(Duration::from_millis(config.between_workers_delay_ms as u64));
    }

    if !launch_errors.is_empty() {
        write_heartbeat(runs_dir, run_id, workers, &mut seq, "BLOCKED", "worker_launch_failed")?;
        for (_, mut child) in children {
            let _ = child.kill();
        }
        return Ok(DispatchResult {
            run_id: run_id.to_string(),
            status: Status::Blocked,
            errors: launch_errors,
            workers: Vec::new(),
            hard_timeout_seconds,
            duration_seconds: start.elapsed().as_secs_f64(),
            timed_out: false,
        });
    }

    let poll_interval = Duration::from_millis(config.poll_interval_ms.max(100) as u64);
    let mut next_heartbeat = Instant::now();
    let mut timed_out = false;

    loop {
        let now = Instant::now();
        let all_done = workers.iter().all(|w| marker_is_present(runs_dir, run_id, w));
        if all_done {
            break;
        }
        if now >= deadline {
            timed_out = true;
            write_heartbeat(runs_dir, run_id, workers, &mut seq, "TIMEOUT_HARD", "hard_timeout_reached")?;
            break;
        }
        if now >= next_heartbeat {
            write_heartbeat(runs_dir, run_id, workers, &mut seq, "RUNNING", "waiting_for_done_markers")?;
            next_heartbeat = now + Duration::from_secs(1);
        }
        std::thread::sleep(poll_interval);
    }

    for (worker, mut child) in children {
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if timed_out {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                let _ = worker;
            }
        }
    }

    let worker_statuses: Vec<WorkerDoneStatus> = workers
        .iter()
        .map(|w| worker_done_status(runs_dir, run_id, w))
        .collect();

    if timed_out {
        write_json(
            &timeout_report_path(runs_dir, run_id),
            &json!({
                "run_id": run_id,
                "stage": "dispatch",
                "cause": "TIMEOUT_HARD",
                "hard_timeout_seconds": hard_timeout_seconds,
                "last_step": "waiting_for_done_markers",
                "workers": workers,
            }),
        )?;
        write_heartbeat(runs_dir, run_id, workers, &mut seq, "TIMEOUT_HARD", "timeout_report_written")?;
        return Ok(DispatchResult {
            run_id: run_id.to_string(),
            status: Status::Blocked,
            errors: vec![format!("dispatch exceeded hard timeout ({hard_timeout_seconds}s)")],
            workers: worker_statuses,
            hard_timeout_seconds,
            duration_seconds: start.elapsed().as_secs_f64(),
            timed_out: true,
        });
    }

    write_heartbeat(runs_dir, run_id, workers, &mut seq, "DONE", "all_markers_present")?;
    let blocked: Vec<String> = worker_statuses
        .iter()
        .filter(|w| w.status != Status::Pass)
        .map(|w| format!("{}: {}", w.worker, w.error))
        .collect();

    Ok(DispatchResult {
        run_id: run_id.to_string(),
        status: if blocked.is_empty() { Status::Pass } else { Status::Blocked },
        errors: blocked,
        workers: worker_statuses,
        hard_timeout_seconds,
        duration_seconds: start.elapsed().as_secs_f64(),
        timed_out: false,
    })
}

fn marker_is_present(runs_dir: &Path, run_id: &str, worker: &str) -> bool {
    let status = worker_done_status(runs_dir, run_id, worker);
    status.status == Status::Pass
}

fn worker_done_status(runs_dir: &Path, run_id: &str, worker: &str) -> WorkerDoneStatus {
    let marker = done_marker_path(runs_dir, run_id, worker);
    let token = done_token(run_id, worker);
    if !marker.exists() {
        return WorkerDoneStatus {
            worker: worker.to_string(),
            marker,
            status: Status::Blocked,
            content_ok: false,
            error: "marker missing".to_string(),
        };
    }
    match std::fs::read_to_string(&marker) {
        Ok(text) if text.contains(&token) => WorkerDoneStatus {
            worker: worker.to_string(),
            marker,
            status: Status::Pass,
            content_ok: true,
            error: String::new(),
        },
        Ok(_) => WorkerDoneStatus {
            worker: worker.to_string(),
            marker,
            status: Status::Blocked,
            content_ok: false,
            error: format!("marker content missing token: {token}"),
        },
        Err(err) => WorkerDoneStatus {
            worker: worker.to_string(),
            marker,
            status: Status::Blocked,
            content_ok: false,
            error: format!("marker unreadable: {err}"),
        },
    }
}

/// Blocks until every worker's DONE marker is present (or `timeout_seconds` elapses), without
/// launching any subprocess. Used by `oneshot`/manual flows where workers are started externally.
pub fn wait_for_done_markers(
    runs_dir: &Path,
    run_id: &str,
    workers: &[&str],
    timeout_seconds: u64,
    poll_interval_ms: u64,
) -> DispatchResult {
    let start = Instant::now();
    let deadline = start + Duration::from_secs(timeout_seconds.max(1));
    let poll = Duration::from_millis(poll_interval_ms.max(100));

    loop {
        let all_done = workers.iter().all(|w| marker_is_present(runs_dir, run_id, w));
        if all_done || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(poll);
    }

    let worker_statuses: Vec<WorkerDoneStatus> = workers.iter().map(|w| worker_done_status(runs_dir, run_id, w)).collect();
    let blocked: Vec<String> = worker_statuses.iter().filter(|w| w.status != Status::Pass).map(|w| w.worker.clone()).collect();
    let status = if blocked.is_empty() { Status::Pass } else { Status::Blocked };
    let errors = if blocked.is_empty() {
        Vec::new()
    } else {
        vec![format!("DONE.marker timeout after {timeout_seconds}s; pending_workers={}", blocked.join(","))]
    };

    DispatchResult {
        run_id: run_id.to_string(),
        status,
        errors,
        workers: worker_statuses,
        hard_timeout_seconds: timeout_seconds,
        duration_seconds: start.elapsed().as_secs_f64(),
        timed_out: status != Status::Pass,
    }
}

pub fn dispatch_result_to_json(result: &DispatchResult) -> Value {
    json!({
        "run_id": result.run_id,
        "status": result.status.to_string(),
        "errors": result.errors,
        "workers": result.workers,
        "hard_timeout_seconds": result.hard_timeout_seconds,
        "duration_seconds": result.duration_seconds,
        "timed_out": result.timed_out,
        "generated_at": iso_utc_now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::util::write_text;
    use tempfile::tempdir;

    #[test]
    fn compute_hard_timeout_scales_with_worker_count() {
        let config = DispatchConfig::default();
        let one = compute_hard_timeout_seconds(&config, 1);
        let four = compute_hard_timeout_seconds(&config, 4);
        assert!(four > one);
        assert!(one >= HARD_TIMEOUT_MIN_SECONDS);
    }

    #[test]
    fn validate_prompt_folder_blocks_on_missing_file() {
        let dir = tempdir().unwrap();
        let result = validate_prompt_folder(dir.path(), "run-1", &["A_worker"]);
        assert_eq!(result.status, Status::Blocked);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn validate_prompt_folder_passes_with_nonempty_files() {
        let dir = tempdir().unwrap();
        write_text(&dir.path().join("run-1").join("A_worker_run-1.txt"), "do the thing\n").unwrap();
        let result = validate_prompt_folder(dir.path(), "run-1", &["A_worker"]);
        assert_eq!(result.status, Status::Pass);
    }

    #[test]
    fn wait_for_done_markers_blocks_on_missing_token() {
        let dir = tempdir().unwrap();
        write_text(&dir.path().join("run-1").join("A_worker").join("DONE.marker"), "wrong token\n").unwrap();
        let result = wait_for_done_markers(dir.path(), "run-1", &["A_worker"], 1, 100);
        assert_eq!(result.status, Status::Blocked);
    }

    #[test]
    fn wait_for_done_markers_passes_on_exact_token() {
        let dir = tempdir().unwrap();
        write_text(&dir.path().join("run-1").join("A_worker").join("DONE.marker"), "DONE run-1 A_worker\n").unwrap();
        let result = wait_for_done_markers(dir.path(), "run-1", &["A_worker"], 5, 100);
        assert_eq!(result.status, Status::Pass);
    }
}
