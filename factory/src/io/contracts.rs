//! Bundle Contracts (C8): scaffolds and validates the fixed file set every worker and the
//! integrator must produce, in two phases — shape (do the required files exist) then schema
//! (do they conform) — so a half-written bundle reports a clear "missing file" instead of a
//! confusing schema error. Grounded on the original `contracts.py`.

use std::path::PathBuf;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::{INTEGRATOR, Status};
use crate::io::config::FactoryConfig;
use crate::io::schema::{SchemaName, validate};
use crate::io::util::read_json;
use crate::io::write_guard::WriteGuard;

pub fn run_dir(runs_dir: &std::path::Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id)
}

pub fn bundle_dir(runs_dir: &std::path::Path, run_id: &str, worker: &str) -> PathBuf {
    run_dir(runs_dir, run_id).join(worker)
}

fn default_worker_status(run_id: &str, worker: &str) -> Value {
    json!({
        "schema_version": 1,
        "contract_version": 2,
        "run_id": run_id,
        "worker_id": worker,
        "status": "PENDING",
        "noop": false,
        "noop_reason": "",
        "noop_ack": "",
        "started_at": "",
        "ended_at": "",
        "required_checks": [],
        "optional_checks": [],
        "errors": [],
        "warnings": [],
        "artifacts": []
    })
}

fn default_files_changed(run_id: &str, worker: &str) -> Value {
    json!({
        "schema_version": 1,
        "run_id": run_id,
        "owner": worker,
        "changes": [],
        "noop": true,
        "noop_reason": "scaffold placeholder: worker has not declared changes",
        "noop_ack": worker
    })
}

fn default_scope_lock(_run_id: &str, worker: &str) -> Value {
    json!({
        "allowed_globs": [format!("{}/**", worker.to_lowercase())],
        "blocked_globs": [],
        "allow_shared_paths": []
    })
}

fn default_handoff(run_id: &str, worker: &str) -> Value {
    json!({
        "schema_version": 1,
        "run_id": run_id,
        "worker_id": worker,
        "summary": "",
        "follow_ups": [],
        "risks": []
    })
}

fn default_log_index(run_id: &str) -> Value {
    json!({
        "schema_version": 1,
        "run_id": run_id,
        "entries": []
    })
}

#[derive(Debug, Clone)]
pub struct ScaffoldResult {
    pub worker: String,
    pub bundle_dir: PathBuf,
    pub created: Vec<String>,
}

fn write_json_if_missing(
    guard: &WriteGuard,
    target: &std::path::Path,
    payload: &Value,
    created: &mut Vec<String>,
) -> Result<()> {
    if !target.exists() {
        guard.write_json(target, payload)?;
        created.push(target.to_string_lossy().to_string());
    }
    Ok(())
}

fn write_text_if_missing(
    guard: &WriteGuard,
    target: &std::path::Path,
    text: &str,
    created: &mut Vec<String>,
) -> Result<()> {
    if !target.exists() {
        guard.write_text(target, text)?;
        created.push(target.to_string_lossy().to_string());
    }
    Ok(())
}

/// Scaffolds a worker bundle's default artifacts. Existing files are left untouched — this is
/// idempotent for re-runs against a partially-populated run directory.
pub fn scaffold_worker_bundle(
    runs_dir: &std::path::Path,
    run_id: &str,
    worker: &str,
) -> Result<ScaffoldResult> {
    let target = bundle_dir(runs_dir, run_id, worker);
    let guard = WriteGuard::new(run_dir(runs_dir, run_id));
    let mut created = Vec::new();

    write_json_if_missing(
        &guard,
        &target.join("STATUS.json"),
        &default_worker_status(run_id, worker),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("FILES_CHANGED.json"),
        &default_files_changed(run_id, worker),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("SCOPE_LOCK.json"),
        &default_scope_lock(run_id, worker),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("HANDOFF_NOTE.json"),
        &default_handoff(run_id, worker),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("LOGS/INDEX.json"),
        &default_log_index(run_id),
        &mut created,
    )?;

    write_text_if_missing(
        &guard,
        &target.join("SUMMARY.md"),
        &format!("# {worker} Summary\n\n- Run ID: `{run_id}`\n- Worker: `{worker}`\n- Status: pending\n"),
        &mut created,
    )?;
    write_text_if_missing(
        &guard,
        &target.join("SUGGESTIONS.md"),
        &format!("# {worker} Suggestions\n\n- None yet.\n"),
        &mut created,
    )?;
    write_text_if_missing(&guard, &target.join("DIFF.patch"), "", &mut created)?;

    created.sort();
    Ok(ScaffoldResult {
        worker: worker.to_string(),
        bundle_dir: target,
        created,
    })
}

/// Scaffolds the integrator bundle's default artifacts.
pub fn scaffold_integrator_bundle(
    runs_dir: &std::path::Path,
    run_id: &str,
) -> Result<ScaffoldResult> {
    let target = bundle_dir(runs_dir, run_id, INTEGRATOR);
    let guard = WriteGuard::new(run_dir(runs_dir, run_id));
    let mut created = Vec::new();

    write_json_if_missing(
        &guard,
        &target.join("STATUS.json"),
        &default_worker_status(run_id, INTEGRATOR),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("FILES_CHANGED.json"),
        &default_files_changed(run_id, INTEGRATOR),
        &mut created,
    )?;
    write_json_if_missing(
        &guard,
        &target.join("LOGS/INDEX.json"),
        &default_log_index(run_id),
        &mut created,
    )?;

    write_text_if_missing(
        &guard,
        &target.join("FINAL_REPORT.txt"),
        "# Final Report\n\nPending integration.\n",
        &mut created,
    )?;
    write_text_if_missing(
        &guard,
        &target.join("MERGE_PLAN.md"),
        "# Merge Plan\n\nPending integration.\n",
        &mut created,
    )?;
    write_text_if_missing(&guard, &target.join("DIFF.patch"), "", &mut created)?;

    created.sort();
    Ok(ScaffoldResult {
        worker: INTEGRATOR.to_string(),
        bundle_dir: target,
        created,
    })
}

/// Scaffolds every worker bundle plus the integrator bundle for a run.
pub fn scaffold_all_bundles(
    runs_dir: &std::path::Path,
    run_id: &str,
    workers: &[&str],
) -> Result<Vec<ScaffoldResult>> {
    let mut results = Vec::new();
    for worker in workers {
        results.push(scaffold_worker_bundle(runs_dir, run_id, worker)?);
    }
    results.push(scaffold_integrator_bundle(runs_dir, run_id)?);
    Ok(results)
}

/// Phase one: confirm every file the contract requires actually exists.
pub fn validate_bundle_shape(
    runs_dir: &std::path::Path,
    run_id: &str,
    worker: &str,
    config: &FactoryConfig,
) -> Vec<String> {
    let target = bundle_dir(runs_dir, run_id, worker);
    if !target.exists() {
        return vec![format!("missing bundle directory: {}", target.display())];
    }
    let required: &[String] = if worker == INTEGRATOR {
        &config.workers.required_integrator_files
    } else {
        &config.workers.required_worker_files
    };
    required
        .iter()
        .filter(|name| !target.join(name.as_str()).exists())
        .map(|name| format!("missing required artifact: {}", target.join(name).display()))
        .collect()
}

/// Phase two: validate each present artifact's JSON against its schema.
pub fn validate_bundle_schemas(
    runs_dir: &std::path::Path,
    run_id: &str,
    worker: &str,
) -> Result<Vec<String>> {
    let target = bundle_dir(runs_dir, run_id, worker);
    let mut errors = Vec::new();

    let status_path = target.join("STATUS.json");
    if status_path.exists() {
        let payload = read_json(&status_path)?;
        let schema = if worker == INTEGRATOR {
            SchemaName::IntegratorStatus
        } else {
            SchemaName::WorkerBundleStatus
        };
        for err in validate(schema, &payload)? {
            errors.push(format!("STATUS.json: {err}"));
        }
    }

    let files_changed_path = target.join("FILES_CHANGED.json");
    if files_changed_path.exists() {
        let payload = read_json(&files_changed_path)?;
        for err in validate(SchemaName::FilesChanged, &payload)? {
            errors.push(format!("FILES_CHANGED.json: {err}"));
        }
    }

    if worker != INTEGRATOR {
        let scope_lock_path = target.join("SCOPE_LOCK.json");
        if scope_lock_path.exists() {
            let payload = read_json(&scope_lock_path)?;
            for err in validate(SchemaName::ScopeLock, &payload)? {
                errors.push(format!("SCOPE_LOCK.json: {err}"));
            }
        }
        let handoff_path = target.join("HANDOFF_NOTE.json");
        if handoff_path.exists() {
            let payload = read_json(&handoff_path)?;
            for err in validate(SchemaName::HandoffNote, &payload)? {
                errors.push(format!("HANDOFF_NOTE.json: {err}"));
            }
        }
    }

    let log_index_path = target.join("LOGS/INDEX.json");
    if log_index_path.exists() {
        let payload = read_json(&log_index_path)?;
        for err in validate(SchemaName::LogIndex, &payload)? {
            errors.push(format!("LOGS/INDEX.json: {err}"));
        }
    }

    Ok(errors)
}

#[derive(Debug, Clone)]
pub struct BundleValidation {
    pub run_id: String,
    pub worker: String,
    pub status: Status,
    pub errors: Vec<String>,
}

/// Validates one bundle: shape first, schema only if shape passed.
pub fn validate_bundle(
    runs_dir: &std::path::Path,
    run_id: &str,
    worker: &str,
    config: &FactoryConfig,
) -> Result<BundleValidation> {
    let shape_errors = validate_bundle_shape(runs_dir, run_id, worker, config);
    let mut all_errors = shape_errors.clone();
    if shape_errors.is_empty() {
        all_errors.extend(validate_bundle_schemas(runs_dir, run_id, worker)?);
    }
    let status = if all_errors.is_empty() {
        Status::Pass
    } else {
        Status::Blocked
    };
    Ok(BundleValidation {
        run_id: run_id.to_string(),
        worker: worker.to_string(),
        status,
        errors: all_errors,
    })
}

#[derive(Debug, Clone)]
pub struct RunValidation {
    pub run_id: String,
    pub status: Status,
    pub results: Vec<BundleValidation>,
}

/// Validates every worker bundle plus the integrator bundle for a run.
pub fn validate_run(
    runs_dir: &std::path::Path,
    run_id: &str,
    workers: &[&str],
    config: &FactoryConfig,
) -> Result<RunValidation> {
    let mut results = Vec::new();
    for worker in workers {
        results.push(validate_bundle(runs_dir, run_id, worker, config)?);
    }
    results.push(validate_bundle(runs_dir, run_id, INTEGRATOR, config)?);
    let status = if results.iter().all(|r| r.status == Status::Pass) {
        Status::Pass
    } else {
        Status::Blocked
    };
    Ok(RunValidation {
        run_id: run_id.to_string(),
        status,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::util::write_text;
    use tempfile::tempdir;

    #[test]
    fn scaffold_worker_bundle_creates_every_required_file() {
        let dir = tempdir().unwrap();
        let result = scaffold_worker_bundle(dir.path(), "run-1", "A_worker").unwrap();
        let config = FactoryConfig::default();
        for name in &config.workers.required_worker_files {
            assert!(result.bundle_dir.join(name).exists(), "missing {name}");
        }
    }

    #[test]
    fn scaffold_is_idempotent_and_does_not_overwrite() {
        let dir = tempdir().unwrap();
        scaffold_worker_bundle(dir.path(), "run-1", "A_worker").unwrap();
        let status_path = bundle_dir(dir.path(), "run-1", "A_worker").join("STATUS.json");
        write_text(&status_path, "{\"custom\": true}").unwrap();
        let second = scaffold_worker_bundle(dir.path(), "run-1", "A_worker").unwrap();
        assert!(!second.created.iter().any(|p| p.contains("STATUS.json")));
        let contents = std::fs::read_to_string(&status_path).unwrap();
        assert!(contents.contains("custom"));
    }

    #[test]
    fn validate_bundle_shape_reports_missing_files() {
        let dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        let errors = validate_bundle_shape(dir.path(), "run-1", "A_worker", &config);
        assert!(!errors.is_empty());
    }

    #[test]
    fn scaffolded_bundle_passes_validation() {
        let dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        scaffold_worker_bundle(dir.path(), "run-1", "A_worker").unwrap();
        let result = validate_bundle(dir.path(), "run-1", "A_worker", &config).unwrap();
        assert_eq!(result.status, Status::Pass, "errors: {:?}", result.errors);
    }

    #[test]
    fn validate_run_collects_every_worker_and_integrator() {
        let dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        scaffold_all_bundles(dir.path(), "run-1", &["A_worker"]).unwrap();
        let run = validate_run(dir.path(), "run-1", &["A_worker"], &config).unwrap();
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.status, Status::Pass, "results: {:?}", run.results);
    }
}
