//! Self-test: round-trips every embedded schema against a minimal conforming fixture and
//! exercises ledger signature integrity end to end. Backs the `self-test` and `contracts-check`
//! CLI surfaces.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::Status;
use crate::io::ledger::{append_typed_event, verify_ledger_signature};
use crate::io::schema::{SchemaName, validate};

fn fixtures() -> Vec<(SchemaName, Value)> {
    vec![
        (
            SchemaName::WorkerBundleStatus,
            json!({
                "schema_version": 1, "contract_version": 1, "run_id": "r1", "worker_id": "A_worker",
                "status": "PASS", "noop": false, "noop_reason": "", "noop_ack": "",
                "started_at": "2026-08-01T00:00:00Z", "ended_at": "2026-08-01T00:01:00Z",
                "required_checks": [], "optional_checks": [], "errors": [], "warnings": [], "artifacts": []
            }),
        ),
        (
            SchemaName::IntegratorStatus,
            json!({
                "schema_version": 1, "contract_version": 1, "run_id": "r1", "worker_id": "Z_integrator",
                "status": "PASS", "noop": false, "noop_reason": "", "noop_ack": "",
                "started_at": "2026-08-01T00:00:00Z", "ended_at": "2026-08-01T00:01:00Z",
                "required_checks": [], "optional_checks": [], "errors": [], "warnings": [], "artifacts": []
            }),
        ),
        (
            SchemaName::FilesChanged,
            json!({"schema_version": 1, "run_id": "r1", "owner": "A_worker", "noop": true, "noop_reason": "no edits", "noop_ack": "ack", "changes": []}),
        ),
        (
            SchemaName::ScopeLock,
            json!({"allowed_globs": ["apps/**"], "blocked_globs": [".git/**"], "allow_shared_paths": []}),
        ),
        (
            SchemaName::RunLedgerEvent,
            json!({
                "schema_version": 1, "ts_utc": "2026-08-01T00:00:00Z", "run_id": "r1", "event_type": "RUN_START",
                "actor": "A_worker", "event_id": "0123456789abcdef", "parent_event_id": "", "duration_ms": 0,
                "file_counts": {}, "hashes": {}, "rc": 0, "details": {}
            }),
        ),
        (
            SchemaName::RunManifest,
            json!({
                "schema_version": 1, "run_id": "r1", "base_ref": "HEAD", "base_sha": "abcdef1234567890abcdef1234567890abcdef12",
                "branch_prefix": "codex/factory", "workers": ["A_worker"], "created_at": "2026-08-01T00:00:00Z",
                "worktrees": {}, "config_snapshot": {}
            }),
        ),
        (
            SchemaName::HandoffNote,
            json!({"schema_version": 1, "run_id": "r1", "worker_id": "A_worker", "summary": "", "follow_ups": [], "risks": []}),
        ),
        (
            SchemaName::LogIndex,
            json!({"schema_version": 1, "run_id": "r1", "entries": []}),
        ),
        (
            SchemaName::ContractsRegistry,
            json!({"schema_version": 1, "bundles": {}}),
        ),
        (
            SchemaName::FactoryConfig,
            json!({"schema_version": 1, "contract_version": 1}),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct SchemaFixtureResult {
    pub name: &'static str,
    pub status: Status,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SelfTestReport {
    pub status: Status,
    pub schema_results: Vec<SchemaFixtureResult>,
    pub ledger_signature_status: Status,
}

fn schema_label(name: SchemaName) -> &'static str {
    match name {
        SchemaName::WorkerBundleStatus => "worker_bundle_status",
        SchemaName::IntegratorStatus => "integrator_status",
        SchemaName::FilesChanged => "files_changed",
        SchemaName::ScopeLock => "scope_lock",
        SchemaName::RunLedgerEvent => "run_ledger_event",
        SchemaName::RunManifest => "run_manifest",
        SchemaName::HandoffNote => "handoff_note",
        SchemaName::LogIndex => "log_index",
        SchemaName::ContractsRegistry => "contracts_registry",
        SchemaName::FactoryConfig => "factory_config",
    }
}

/// Validates every embedded schema against a minimal fixture known to conform, and confirms the
/// ledger signature round-trips after an append into a scratch ledger directory.
pub fn run_self_test(scratch_runs_dir: &Path) -> Result<SelfTestReport> {
    let mut schema_results = Vec::new();
    for (name, fixture) in fixtures() {
        let errors = validate(name, &fixture)?;
        schema_results.push(SchemaFixtureResult {
            name: schema_label(name),
            status: if errors.is_empty() { Status::Pass } else { Status::Blocked },
            errors,
        });
    }

    append_typed_event(
        scratch_runs_dir,
        "self-test",
        "self-test-run",
        crate::core::types::EventType::RunStart,
        "self-test",
        json!({}),
    )?;
    let sig = verify_ledger_signature(scratch_runs_dir);

    let any_schema_failed = schema_results.iter().any(|r| r.status != Status::Pass);
    let status = if any_schema_failed || sig.status != Status::Pass { Status::Blocked } else { Status::Pass };

    Ok(SelfTestReport { status, schema_results, ledger_signature_status: sig.status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn self_test_passes_on_fresh_scratch_dir() {
        let dir = tempdir().unwrap();
        let report = run_self_test(dir.path()).unwrap();
        assert_eq!(report.status, Status::Pass, "{:?}", report.schema_results);
    }

    #[test]
    fn every_schema_has_a_fixture() {
        assert_eq!(fixtures().len(), 10);
    }
}
