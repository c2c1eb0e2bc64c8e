//! Integrator (C11): folds every worker's bundle into one merged patch, one merged
//! `FILES_CHANGED.json`, and one `FINAL_REPORT.txt`, running the Overlap & Scope Detector and the
//! Meaningful Gate along the way. Grounded on the original `integrator.py`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::overlap::{
    OverlapReport, ScopeLock, ScopeReport, WorkerOverlapInput, detect_file_overlaps, detect_scope_violations_all,
};
use crate::core::status_eval::evaluate_status;
use crate::core::types::{CheckResult, EventType, INTEGRATOR, Status};
use crate::io::attestations::write_all_attestations;
use crate::io::config::FactoryConfig;
use crate::io::contracts::{bundle_dir, run_dir, scaffold_integrator_bundle, validate_bundle};
use crate::io::ledger::{append_typed_event, verify_ledger_signature};
use crate::io::meaningful_gate::{canonical_path, parse_patch_paths, run_meaningful_gate};
use crate::io::schema::{SchemaName, validate};
use crate::io::util::{read_json, read_text, stable_sha256_text};
use crate::io::write_guard::WriteGuard;

struct WorkerInput {
    worker: String,
    bundle: std::path::PathBuf,
    present: bool,
    validation_status: Status,
    validation_errors: Vec<String>,
    files_changed: Vec<Value>,
    summary: String,
    diff: String,
    noop: bool,
    noop_reason: String,
    noop_ack: String,
    scope_lock: ScopeLock,
    allow_shared_paths: BTreeSet<String>,
}

fn collect_worker_inputs(runs_dir: &Path, run_id: &str, workers: &[&str], config: &FactoryConfig) -> Result<Vec<WorkerInput>> {
    let mut collected = Vec::new();
    for worker in workers {
        let bundle = bundle_dir(runs_dir, run_id, worker);
        let validation = validate_bundle(runs_dir, run_id, worker, config)?;
        let mut input = WorkerInput {
            worker: worker.to_string(),
            bundle: bundle.clone(),
            present: bundle.exists(),
            validation_status: validation.status,
            validation_errors: validation.errors,
            files_changed: Vec::new(),
            summary: String::new(),
            diff: String::new(),
            noop: false,
            noop_reason: String::new(),
            noop_ack: String::new(),
            scope_lock: ScopeLock::default(),
            allow_shared_paths: BTreeSet::new(),
        };

        if input.present {
            let files_changed_path = bundle.join("FILES_CHANGED.json");
            if files_changed_path.exists() {
                let payload = read_json(&files_changed_path)?;
                input.files_changed = payload["changes"].as_array().cloned().unwrap_or_default();
                input.noop = payload["noop"].as_bool().unwrap_or(false);
                input.noop_reason = payload["noop_reason"].as_str().unwrap_or_default().trim().to_string();
                input.noop_ack = payload["noop_ack"].as_str().unwrap_or_default().trim().to_string();
            }
            let summary_path = bundle.join("SUMMARY.md");
            if summary_path.exists() {
                input.summary = read_text(&summary_path)?.trim().to_string();
            }
            let diff_path = bundle.join("DIFF.patch");
            if diff_path.exists() {
                input.diff = read_text(&diff_path)?;
            }
            let scope_lock_path = bundle.join("SCOPE_LOCK.json");
            if scope_lock_path.exists() {
                let payload = read_json(&scope_lock_path)?;
                input.scope_lock = ScopeLock {
                    allowed_globs: payload["allowed_globs"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default(),
                    blocked_globs: payload["blocked_globs"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default(),
                };
                input.allow_shared_paths = payload["allow_shared_paths"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
            }
        }
        collected.push(input);
    }
    Ok(collected)
}

fn merge_files_changed(run_id: &str, collected: &[WorkerInput]) -> Value {
    let mut merged: Vec<(String, Value)> = Vec::new();
    let mut noop_records: Vec<(String, String, String)> = Vec::new();
    for item in collected {
        if item.noop && !item.noop_reason.is_empty() && !item.noop_ack.is_empty() {
            noop_records.push((item.worker.clone(), item.noop_reason.clone(), item.noop_ack.clone()));
        }
        for change in &item.files_changed {
            let Some(obj) = change.as_object() else { continue };
            let path = obj.get("path").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let entry = json!({
                "path": path,
                "change_type": obj.get("change_type").and_then(|v| v.as_str()).unwrap_or("modified"),
                "owner": item.worker,
                "reason": obj.get("reason").and_then(|v| v.as_str()).unwrap_or_default(),
                "sha256": obj.get("sha256").and_then(|v| v.as_str()).unwrap_or_default(),
            });
            merged.push((path, entry));
        }
    }
    merged.sort_by(|a, b| a.0.cmp(&b.0));
    let changes: Vec<Value> = merged.into_iter().map(|(_, v)| v).collect();

    let mut payload = json!({
        "schema_version": 1,
        "run_id": run_id,
        "owner": INTEGRATOR,
        "changes": changes,
    });
    if changes_is_empty(&payload) && !noop_records.is_empty() && noop_records.len() == collected.len() {
        let mut ordered = noop_records;
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        let reason = ordered.iter().map(|(w, r, _)| format!("{w}: {r}")).collect::<Vec<_>>().join("; ");
        let ack = ordered.iter().map(|(w, _, _)| w.clone()).collect::<Vec<_>>().join(",");
        payload["noop"] = json!(true);
        payload["noop_reason"] = json!(reason);
        payload["noop_ack"] = json!(ack);
    } else {
        payload["noop"] = json!(false);
        payload["noop_reason"] = json!("");
        payload["noop_ack"] = json!("");
    }
    payload
}

fn changes_is_empty(payload: &Value) -> bool {
    payload["changes"].as_array().is_none_or(|a| a.is_empty())
}

fn merge_patch(collected: &[WorkerInput]) -> String {
    let mut chunks = Vec::new();
    for item in collected {
        if item.diff.trim().is_empty() {
            continue;
        }
        chunks.push(format!("# >>> BEGIN {}\n{}\n# <<< END {}\n", item.worker, item.diff.trim_end(), item.worker));
    }
    let joined = chunks.join("\n").trim().to_string();
    if joined.is_empty() { joined } else { joined + "\n" }
}

fn render_merge_plan(run_id: &str, collected: &[WorkerInput], overlap: &OverlapReport, scope: &ScopeReport, checks: &[CheckResult]) -> String {
    let mut lines = vec![format!("# Merge Plan: {run_id}"), String::new(), "## Worker Inputs".to_string()];
    for item in collected {
        lines.push(format!("- {}: {} ({} errors)", item.worker, item.validation_status, item.validation_errors.len()));
    }
    lines.push(String::new());
    lines.push("## Required Checks".to_string());
    for check in checks {
        lines.push(format!("- {}: {} (rc={})", check.name, check.status, check.rc));
    }
    lines.push(String::new());
    lines.push("## Overlap Report".to_string());
    if overlap.overlaps.is_empty() {
        lines.push("- None".to_string());
    } else {
        for o in &overlap.overlaps {
            lines.push(format!("- {}: {} ({})", o.status, o.path, o.workers.join(", ")));
        }
    }
    lines.push(String::new());
    lines.push("## Scope Violations".to_string());
    if scope.violations.is_empty() {
        lines.push("- None".to_string());
    } else {
        for v in &scope.violations {
            lines.push(format!("- {}: {} ({})", v.worker, v.path, v.rule));
        }
    }
    lines.join("\n").trim_end().to_string() + "\n"
}

#[allow(clippy::too_many_arguments)]
fn render_final_report(
    run_id: &str,
    collected: &[WorkerInput],
    overlap: &OverlapReport,
    scope: &ScopeReport,
    final_status: Status,
    checks: &[CheckResult],
    contract_version: u32,
    schema_errors: &[String],
    policy_errors: &[String],
    ledger_sig: Option<&crate::io::ledger::LedgerSignatureStatus>,
    gate_verdict: &str,
    gate_noop: bool,
    gate_fail_modes: &[String],
) -> String {
    let mut lines = vec![
        format!("# FINAL_REPORT - {run_id}"),
        String::new(),
        "## Summary".to_string(),
        format!("- Final status: {final_status}"),
        format!("- Contract version: {contract_version}"),
        format!("- Worker bundles processed: {}", collected.len()),
        format!("- Overlap conflicts: {}", overlap.blocked),
        format!("- Scope violations: {}", scope.blocked),
        format!("- Hidden overlaps: {}", overlap.hidden_overlaps.len()),
        format!("- Invalid FILES_CHANGED paths: {}", overlap.invalid_paths.len()),
        format!("- Meaningful gate verdict: {gate_verdict}"),
        format!("- NOOP declared: {}", gate_noop),
        String::new(),
        "## Required Checks".to_string(),
    ];
    for check in checks {
        lines.push(format!("- {}: {} (rc={})", check.name, check.status, check.rc));
    }
    lines.push(String::new());
    lines.push("## Inputs".to_string());
    for item in collected {
        lines.push(format!(
            "- {}: {} | errors={} | bundle={}",
            item.worker,
            item.validation_status,
            item.validation_errors.len(),
            item.bundle.display()
        ));
    }
    lines.push(String::new());
    lines.push("## Worker Summaries".to_string());
    for item in collected {
        lines.push(format!("### {}", item.worker));
        lines.push(if item.summary.is_empty() { "- No summary provided".to_string() } else { item.summary.clone() });
        lines.push(String::new());
    }
    lines.push("## Blocking Conditions".to_string());
    let mut blockers = BTreeSet::new();
    for item in collected {
        for err in &item.validation_errors {
            blockers.insert(format!("{}: {err}", item.worker));
        }
    }
    for o in &overlap.overlaps {
        if o.status == Status::Blocked {
            blockers.insert(format!("overlap: {} ({})", o.path, o.workers.join(", ")));
        }
    }
    for h in &overlap.hidden_overlaps {
        blockers.insert(format!("hidden_overlap: {} {}", h.worker, h.path));
    }
    for ip in &overlap.invalid_paths {
        blockers.insert(format!("invalid_path: {} {}", ip.worker, ip.path));
    }
    for v in &scope.violations {
        blockers.insert(format!("scope: {} {}", v.worker, v.path));
    }
    for e in schema_errors {
        blockers.insert(format!("schema: {e}"));
    }
    for e in policy_errors {
        blockers.insert(format!("policy: {e}"));
    }
    for mode in gate_fail_modes {
        blockers.insert(format!("meaningful_gate: {mode}"));
    }
    if blockers.is_empty() {
        lines.push("- None".to_string());
    } else {
        for b in blockers {
            lines.push(format!("- {b}"));
        }
    }

    lines.push(String::new());
    lines.push("## Ledger Signature".to_string());
    lines.push(format!("- Status: {}", ledger_sig.map(|s| s.status.to_string()).unwrap_or_else(|| "UNKNOWN".to_string())));
    lines.push(format!("- Signature file: {}", ledger_sig.map(|s| s.signature.display().to_string()).unwrap_or_default()));
    lines.push(String::new());
    lines.push("## NEXT ACTION".to_string());
    lines.push("- If BLOCKED: resolve overlap/scope/policy issues and rerun integration.".to_string());
    lines.push("- If FAIL: inspect logs and fix internal factory errors.".to_string());
    lines.push("- If PASS: run project-level validation and publish the run report.".to_string());
    lines.push("- If PASS with NOOP: do not count as phase progress; record explicit noop rationale.".to_string());

    lines.join("\n").trim_end().to_string() + "\n"
}

pub struct IntegrationResult {
    pub run_id: String,
    pub status: Status,
    pub z_dir: std::path::PathBuf,
    pub report_path: std::path::PathBuf,
    pub worker_blockers: usize,
    pub overlap_blockers: usize,
    pub scope_blockers: usize,
}

/// Runs the full integration pipeline for `run_id`: collects worker bundles, detects overlaps
/// and scope violations, merges patches, runs the meaningful-execution gate, writes attestations,
/// and produces `FINAL_REPORT.txt`.
///
/// An internal error anywhere in the pipeline (I/O failure, unreadable bundle, schema panic)
/// does not propagate: it is caught, recorded as a FAIL with a minimal `STATUS.json`, and closed
/// out with a `RUN_END` event so the run never hangs without a terminal ledger entry.
pub fn integrate_run(
    repo_root: &Path,
    runs_dir: &Path,
    run_id: &str,
    owner: &str,
    workers: &[&str],
    config: &FactoryConfig,
) -> Result<IntegrationResult> {
    match integrate_run_inner(repo_root, runs_dir, run_id, owner, workers, config) {
        Ok(result) => Ok(result),
        Err(err) => emit_internal_failure(runs_dir, run_id, owner, config, &err),
    }
}

fn emit_internal_failure(
    runs_dir: &Path,
    run_id: &str,
    owner: &str,
    config: &FactoryConfig,
    err: &anyhow::Error,
) -> Result<IntegrationResult> {
    let run_root = run_dir(runs_dir, run_id);
    let z_dir = bundle_dir(runs_dir, run_id, INTEGRATOR);
    let guard = WriteGuard::new(&run_root);
    let now = crate::io::util::iso_utc_now();
    let final_status = evaluate_status(&[], &[], &[], &[err.to_string()]);

    let status_payload = json!({
        "schema_version": 1,
        "contract_version": config.contract_version,
        "run_id": run_id,
        "worker_id": INTEGRATOR,
        "status": final_status.to_string(),
        "noop": false,
        "noop_reason": "",
        "noop_ack": "",
        "started_at": now,
        "ended_at": now,
        "required_checks": Vec::<Value>::new(),
        "optional_checks": Vec::<Value>::new(),
        "errors": [err.to_string()],
        "warnings": Vec::<Value>::new(),
        "artifacts": Vec::<Value>::new(),
    });
    let final_report = format!("# FINAL_REPORT - {run_id}\n\n## Summary\n- Final status: {final_status}\n- Internal error: {err}\n");
    let report_path = z_dir.join("FINAL_REPORT.txt");

    let _ = guard.write_json(&z_dir.join("STATUS.json"), &status_payload);
    let _ = guard.write_text(&report_path, &final_report);
    let _ = append_typed_event(
        runs_dir,
        owner,
        run_id,
        EventType::RunEnd,
        INTEGRATOR,
        json!({"status": final_status.to_string(), "kind": "factory", "internal_error": err.to_string()}),
    );

    Ok(IntegrationResult {
        run_id: run_id.to_string(),
        status: final_status,
        z_dir,
        report_path,
        worker_blockers: 0,
        overlap_blockers: 0,
        scope_blockers: 0,
    })
}

fn integrate_run_inner(
    repo_root: &Path,
    runs_dir: &Path,
    run_id: &str,
    owner: &str,
    workers: &[&str],
    config: &FactoryConfig,
) -> Result<IntegrationResult> {
    scaffold_integrator_bundle(runs_dir, run_id)?;
    let run_root = run_dir(runs_dir, run_id);
    let z_dir = bundle_dir(runs_dir, run_id, INTEGRATOR);
    let guard = WriteGuard::new(&run_root);
    let run_log = z_dir.join("LOGS").join("integration.log.txt");

    append_typed_event(
        runs_dir,
        owner,
        run_id,
        EventType::IntegrateStart,
        INTEGRATOR,
        json!({"status": "PASS", "kind": "factory", "workers": workers}),
    )?;
    guard.append_line(&run_log, &format!("[start] run_id={run_id}"))?;

    let collected = collect_worker_inputs(runs_dir, run_id, workers, config)?;

    let overlap_inputs: Vec<WorkerOverlapInput> = collected
        .iter()
        .map(|item| {
            let declared_paths: Vec<String> = item
                .files_changed
                .iter()
                .filter_map(|c| c.get("path").and_then(|v| v.as_str()).map(canonical_path))
                .collect();
            WorkerOverlapInput {
                worker: item.worker.clone(),
                declared_paths,
                patch_paths: parse_patch_paths(&item.diff),
                patch_sha256: stable_sha256_text(&item.diff),
                allow_shared_paths: item.allow_shared_paths.clone(),
            }
        })
        .collect();
    let overlap_report = detect_file_overlaps(
        &overlap_inputs,
        config.run.strict_collision_mode,
        config.run.allow_identical_patch_overlap,
    );

    let scope_inputs: Vec<(String, Vec<String>, ScopeLock)> = collected
        .iter()
        .map(|item| {
            let declared: Vec<String> = item
                .files_changed
                .iter()
                .filter_map(|c| c.get("path").and_then(|v| v.as_str()).map(canonical_path))
                .collect();
            (item.worker.clone(), declared, item.scope_lock.clone())
        })
        .collect();
    let scope_report = detect_scope_violations_all(&scope_inputs);

    let merged_files = merge_files_changed(run_id, &collected);
    let merged_patch = merge_patch(&collected);

    let worker_blockers = collected.iter().filter(|i| i.validation_status != Status::Pass).count();
    let overlap_blockers = overlap_report.overlaps.iter().filter(|o| o.status == Status::Blocked).count();
    let hidden_overlap_blockers = overlap_report.hidden_overlaps.len();
    let invalid_path_blockers = overlap_report.invalid_paths.len();
    let scope_blockers = scope_report.violations.len();

    let mut blockers = Vec::new();
    if worker_blockers > 0 {
        blockers.push(format!("worker bundle blockers={worker_blockers}"));
    }
    if overlap_blockers > 0 {
        blockers.push(format!("overlap blockers={overlap_blockers}"));
    }
    if hidden_overlap_blockers > 0 {
        blockers.push(format!("hidden overlap blockers={hidden_overlap_blockers}"));
    }
    if invalid_path_blockers > 0 {
        blockers.push(format!("invalid path blockers={invalid_path_blockers}"));
    }
    if scope_blockers > 0 {
        blockers.push(format!("scope blockers={scope_blockers}"));
    }

    let mut required_checks = vec![
        CheckResult::new("worker_bundle_validation", Status::Pass, INTEGRATOR).with_rc(if worker_blockers == 0 { 0 } else { 2 }),
        CheckResult::new("overlap_detection", Status::Pass, INTEGRATOR).with_rc(
            if overlap_blockers == 0 && hidden_overlap_blockers == 0 && invalid_path_blockers == 0 { 0 } else { 2 },
        ),
        CheckResult::new("scope_detection", Status::Pass, INTEGRATOR).with_rc(if scope_blockers == 0 { 0 } else { 2 }),
    ];

    let mut schema_errors: Vec<String> = Vec::new();
    let merged_schema_errors = validate(SchemaName::FilesChanged, &merged_files)?;
    if merged_schema_errors.is_empty() {
        required_checks.push(CheckResult::new("schema_files_changed", Status::Pass, INTEGRATOR));
    } else {
        schema_errors.extend(merged_schema_errors.iter().map(|e| format!("FILES_CHANGED.json: {e}")));
        required_checks.push(CheckResult::new("schema_files_changed", Status::Pass, INTEGRATOR).with_rc(2));
    }

    let mut final_status = evaluate_status(&required_checks, &schema_errors, &blockers, &[]);

    let started_at = crate::io::util::iso_utc_now();
    let mut status_payload = json!({
        "schema_version": 1,
        "contract_version": config.contract_version,
        "run_id": run_id,
        "worker_id": INTEGRATOR,
        "status": final_status.to_string(),
        "noop": merged_files["noop"],
        "noop_reason": merged_files["noop_reason"],
        "noop_ack": merged_files["noop_ack"],
        "started_at": started_at,
        "ended_at": "",
        "required_checks": required_checks.iter().map(check_to_json).collect::<Vec<_>>(),
        "optional_checks": Vec::<Value>::new(),
        "errors": collected.iter().flat_map(|i| i.validation_errors.iter().map(move |e| format!("{}: {e}", i.worker))).collect::<Vec<_>>(),
        "warnings": Vec::<Value>::new(),
        "artifacts": ["FINAL_REPORT.txt", "MERGE_PLAN.md", "FILES_CHANGED.json", "DIFF.patch", "LOGS/integration.log.txt", "LOGS/INDEX.json"],
    });

    let status_schema_errors = validate(SchemaName::IntegratorStatus, &status_payload)?;
    if !status_schema_errors.is_empty() {
        schema_errors.extend(status_schema_errors.iter().map(|e| format!("STATUS.json: {e}")));
        required_checks.push(CheckResult::new("schema_integrator_status", Status::Pass, INTEGRATOR).with_rc(2));
    } else {
        required_checks.push(CheckResult::new("schema_integrator_status", Status::Pass, INTEGRATOR));
    }

    let log_index_payload = json!({
        "schema_version": 1,
        "run_id": run_id,
        "entries": [{"owner": INTEGRATOR, "label": "integration", "path": "LOGS/integration.log.txt", "sha256": ""}],
    });
    let log_schema_errors = validate(SchemaName::LogIndex, &log_index_payload)?;
    if !log_schema_errors.is_empty() {
        schema_errors.extend(log_schema_errors.iter().map(|e| format!("LOGS/INDEX.json: {e}")));
        required_checks.push(CheckResult::new("schema_log_index", Status::Pass, INTEGRATOR).with_rc(2));
    } else {
        required_checks.push(CheckResult::new("schema_log_index", Status::Pass, INTEGRATOR));
    }

    final_status = evaluate_status(&required_checks, &schema_errors, &blockers, &[]);
    status_payload["status"] = json!(final_status.to_string());
    status_payload["required_checks"] = json!(required_checks.iter().map(check_to_json).collect::<Vec<_>>());

    let mut merge_plan = render_merge_plan(run_id, &collected, &overlap_report, &scope_report, &required_checks);
    let mut final_report = render_final_report(
        run_id,
        &collected,
        &overlap_report,
        &scope_report,
        final_status,
        &required_checks,
        config.contract_version,
        &schema_errors,
        &[],
        None,
        "N/A",
        false,
        &[],
    );

    let mut policy_errors: Vec<String> = Vec::new();
    if let Err(err) = write_standard_outputs(&guard, &z_dir, &merged_files, &merged_patch, &merge_plan, &final_report, &status_payload, &log_index_payload) {
        policy_errors.push(err.to_string());
    }

    if !policy_errors.is_empty() {
        required_checks.push(CheckResult::new("z_write_policy", Status::Blocked, INTEGRATOR));
        let mut all_blockers = blockers.clone();
        all_blockers.extend(policy_errors.clone());
        final_status = evaluate_status(&required_checks, &schema_errors, &all_blockers, &[]);
        status_payload["status"] = json!(final_status.to_string());
        status_payload["required_checks"] = json!(required_checks.iter().map(check_to_json).collect::<Vec<_>>());
        merge_plan = render_merge_plan(run_id, &collected, &overlap_report, &scope_report, &required_checks);
        final_report = render_final_report(
            run_id,
            &collected,
            &overlap_report,
            &scope_report,
            final_status,
            &required_checks,
            config.contract_version,
            &schema_errors,
            &policy_errors,
            None,
            "N/A",
            false,
            &[],
        );
        let _ = write_standard_outputs(&guard, &z_dir, &merged_files, &merged_patch, &merge_plan, &final_report, &status_payload, &log_index_payload);
    }

    let gate = run_meaningful_gate(repo_root, runs_dir, run_id)?;
    let gate_verdict = gate.verdict.status.to_string();
    let gate_fail_modes: Vec<String> = gate.verdict.fail_modes.iter().map(|m| m.as_str().to_string()).collect();
    required_checks.push(
        CheckResult::new("meaningful_execution_gate", Status::Pass, INTEGRATOR)
            .with_rc(if matches!(gate.verdict.status, Status::Pass | Status::Warn) { 0 } else { 2 }),
    );
    let mut gate_blockers: BTreeSet<String> = gate_fail_modes.iter().map(|m| format!("meaningful_gate:{m}")).collect();
    if matches!(gate.verdict.status, Status::Blocked | Status::Fail) && gate_blockers.is_empty() {
        gate_blockers.insert(format!("meaningful_gate:{gate_verdict}"));
    }

    let mut all_blockers = blockers.clone();
    all_blockers.extend(policy_errors.clone());
    all_blockers.extend(gate_blockers.iter().cloned());
    final_status = evaluate_status(&required_checks, &schema_errors, &all_blockers, &[]);
    status_payload["status"] = json!(final_status.to_string());
    status_payload["required_checks"] = json!(required_checks.iter().map(check_to_json).collect::<Vec<_>>());
    status_payload["noop"] = json!(gate.verdict.noop);

    let ended_at = crate::io::util::iso_utc_now();
    status_payload["ended_at"] = json!(ended_at);

    let ledger_sig = verify_ledger_signature(runs_dir);
    final_report = render_final_report(
        run_id,
        &collected,
        &overlap_report,
        &scope_report,
        final_status,
        &required_checks,
        config.contract_version,
        &schema_errors,
        &policy_errors,
        Some(&ledger_sig),
        &gate_verdict,
        gate.verdict.noop,
        &gate_fail_modes,
    );

    guard.write_json(&z_dir.join("STATUS.json"), &status_payload)?;
    guard.write_text(&z_dir.join("FINAL_REPORT.txt"), &final_report)?;
    guard.append_line(&run_log, &format!("[done] final_status={final_status}"))?;

    let report_path = z_dir.join("FINAL_REPORT.txt");
    write_all_attestations(runs_dir, run_id, &report_path)?;

    let report_hash = stable_sha256_text(&final_report);
    append_typed_event(
        runs_dir,
        owner,
        run_id,
        EventType::ReportWritten,
        INTEGRATOR,
        json!({
            "kind": "factory",
            "status": final_status.to_string(),
            "workers": workers,
            "worker_blockers": worker_blockers,
            "overlap_blockers": overlap_blockers,
            "scope_blockers": scope_blockers,
            "report": report_path.to_string_lossy(),
            "path": run_root.to_string_lossy(),
            "meaningful_gate_verdict": gate_verdict,
        }),
    )?;
    append_typed_event(
        runs_dir,
        owner,
        run_id,
        EventType::RunEnd,
        INTEGRATOR,
        json!({"status": final_status.to_string(), "kind": "factory", "report_sha256": report_hash}),
    )?;

    Ok(IntegrationResult {
        run_id: run_id.to_string(),
        status: final_status,
        z_dir,
        report_path,
        worker_blockers,
        overlap_blockers,
        scope_blockers,
    })
}

fn check_to_json(check: &CheckResult) -> Value {
    json!({
        "name": check.name,
        "status": check.status.to_string(),
        "rc": check.rc,
        "required": check.required,
        "detail": check.detail,
        "actor": check.actor,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_standard_outputs(
    guard: &WriteGuard,
    z_dir: &Path,
    merged_files: &Value,
    merged_patch: &str,
    merge_plan: &str,
    final_report: &str,
    status_payload: &Value,
    log_index_payload: &Value,
) -> Result<()> {
    guard.write_json(&z_dir.join("FILES_CHANGED.json"), merged_files)?;
    guard.write_text(&z_dir.join("DIFF.patch"), merged_patch)?;
    guard.write_text(&z_dir.join("MERGE_PLAN.md"), merge_plan)?;
    guard.write_text(&z_dir.join("FINAL_REPORT.txt"), final_report)?;
    guard.write_json(&z_dir.join("STATUS.json"), status_payload)?;
    guard.write_json(&z_dir.join("LOGS").join("INDEX.json"), log_index_payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::contracts::scaffold_worker_bundle;
    use crate::io::util::write_json;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_git_repo(root: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            assert!(Command::new("git").args(&args).current_dir(root).status().unwrap().success());
        }
        std::fs::write(root.join("README.md"), "hi\n").unwrap();
        assert!(Command::new("git").args(["add", "README.md"]).current_dir(root).status().unwrap().success());
        assert!(
            Command::new("git")
                .args(["commit", "-m", "init"])
                .current_dir(root)
                .status()
                .unwrap()
                .success()
        );
    }

    #[test]
    fn integrate_run_with_noop_bundles_passes() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let config = FactoryConfig::default();

        for worker in ["A_worker"] {
            scaffold_worker_bundle(runs_dir.path(), "run-1", worker).unwrap();
        }

        let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &["A_worker"], &config).unwrap();
        assert_eq!(result.status, Status::Pass, "checks failed, see report: {}", std::fs::read_to_string(&result.report_path).unwrap());
        assert!(result.report_path.exists());
    }

    #[test]
    fn integrate_run_blocks_on_missing_bundle() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        let result = integrate_run(repo_dir.path(), runs_dir.path(), "run-1", "tester", &["A_worker"], &config).unwrap();
        assert_eq!(result.status, Status::Blocked);
    }

    #[test]
    fn merge_files_changed_collects_declared_changes() {
        let collected = vec![WorkerInput {
            worker: "A_worker".to_string(),
            bundle: std::path::PathBuf::new(),
            present: true,
            validation_status: Status::Pass,
            validation_errors: Vec::new(),
            files_changed: vec![json!({"path": "apps/a.rs", "change_type": "modified"})],
            summary: String::new(),
            diff: String::new(),
            noop: false,
            noop_reason: String::new(),
            noop_ack: String::new(),
            scope_lock: ScopeLock::default(),
            allow_shared_paths: BTreeSet::new(),
        }];
        let merged = merge_files_changed("run-1", &collected);
        assert_eq!(merged["changes"].as_array().unwrap().len(), 1);
        let _ = write_json;
    }
}
