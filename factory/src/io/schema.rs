//! Schema Engine: validates factory artifacts against embedded JSON Schema documents.
//!
//! Schemas are compiled into the binary with `include_str!` so validation never depends on
//! files shipping alongside the executable, mirroring how the teacher embeds its tree schema.

use anyhow::{Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use std::sync::OnceLock;

/// Names of every schema the factory validates artifacts against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemaName {
    WorkerBundleStatus,
    IntegratorStatus,
    FilesChanged,
    ScopeLock,
    RunLedgerEvent,
    RunManifest,
    HandoffNote,
    LogIndex,
    ContractsRegistry,
    FactoryConfig,
}

impl SchemaName {
    fn source(self) -> &'static str {
        match self {
            SchemaName::WorkerBundleStatus => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/worker_bundle_status.schema.json"
            )),
            SchemaName::IntegratorStatus => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/integrator_status.schema.json"
            )),
            SchemaName::FilesChanged => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/files_changed.schema.json"
            )),
            SchemaName::ScopeLock => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/scope_lock.schema.json"
            )),
            SchemaName::RunLedgerEvent => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/run_ledger_event.schema.json"
            )),
            SchemaName::RunManifest => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/run_manifest.schema.json"
            )),
            SchemaName::HandoffNote => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/handoff_note.schema.json"
            )),
            SchemaName::LogIndex => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/log_index.schema.json"
            )),
            SchemaName::ContractsRegistry => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/contracts_registry.schema.json"
            )),
            SchemaName::FactoryConfig => include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../schemas/factory_config.schema.json"
            )),
        }
    }

    fn slot(self) -> &'static OnceLock<Validator> {
        static WORKER_BUNDLE_STATUS: OnceLock<Validator> = OnceLock::new();
        static INTEGRATOR_STATUS: OnceLock<Validator> = OnceLock::new();
        static FILES_CHANGED: OnceLock<Validator> = OnceLock::new();
        static SCOPE_LOCK: OnceLock<Validator> = OnceLock::new();
        static RUN_LEDGER_EVENT: OnceLock<Validator> = OnceLock::new();
        static RUN_MANIFEST: OnceLock<Validator> = OnceLock::new();
        static HANDOFF_NOTE: OnceLock<Validator> = OnceLock::new();
        static LOG_INDEX: OnceLock<Validator> = OnceLock::new();
        static CONTRACTS_REGISTRY: OnceLock<Validator> = OnceLock::new();
        static FACTORY_CONFIG: OnceLock<Validator> = OnceLock::new();
        match self {
            SchemaName::WorkerBundleStatus => &WORKER_BUNDLE_STATUS,
            SchemaName::IntegratorStatus => &INTEGRATOR_STATUS,
            SchemaName::FilesChanged => &FILES_CHANGED,
            SchemaName::ScopeLock => &SCOPE_LOCK,
            SchemaName::RunLedgerEvent => &RUN_LEDGER_EVENT,
            SchemaName::RunManifest => &RUN_MANIFEST,
            SchemaName::HandoffNote => &HANDOFF_NOTE,
            SchemaName::LogIndex => &LOG_INDEX,
            SchemaName::ContractsRegistry => &CONTRACTS_REGISTRY,
            SchemaName::FactoryConfig => &FACTORY_CONFIG,
        }
    }

    fn validator(self) -> Result<&'static Validator> {
        if let Some(v) = self.slot().get() {
            return Ok(v);
        }
        let schema_value: Value = serde_json::from_str(self.source())
            .map_err(|err| anyhow!("embedded schema {:?} is not valid JSON: {}", self, err))?;
        let compiled = jsonschema::options()
            .with_draft(jsonschema::Draft::Draft202012)
            .build(&schema_value)
            .map_err(|err| anyhow!("embedded schema {:?} failed to compile: {}", self, err))?;
        Ok(self.slot().get_or_init(|| compiled))
    }
}

/// Validates `instance` against the named schema, returning pointer-qualified error strings.
///
/// An empty vector means the instance is valid. Errors are formatted as
/// `"<json-pointer>: <reason>"` so callers can attach them directly to a bundle's `errors` field.
pub fn validate(name: SchemaName, instance: &Value) -> Result<Vec<String>> {
    let validator = name.validator()?;
    let errors = validator
        .iter_errors(instance)
        .map(|err| format!("{}: {}", err.instance_path(), err))
        .collect();
    Ok(errors)
}

/// Convenience wrapper returning `Ok(())` or a joined error, for call sites that just need a
/// pass/fail gate rather than the individual pointer-qualified messages.
pub fn validate_strict(name: SchemaName, instance: &Value) -> Result<()> {
    let errors = validate(name, instance)?;
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("schema validation failed: {}", errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_bundle_status_rejects_missing_fields() {
        let errors = validate(SchemaName::WorkerBundleStatus, &json!({})).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn worker_bundle_status_accepts_minimal_valid_document() {
        let doc = json!({
            "schema_version": 1,
            "contract_version": 1,
            "run_id": "r1",
            "worker_id": "A_worker",
            "status": "PASS",
            "noop": false,
            "noop_reason": "",
            "noop_ack": "",
            "started_at": "2026-08-01T00:00:00Z",
            "ended_at": "2026-08-01T00:01:00Z",
            "required_checks": [],
            "optional_checks": [],
            "errors": [],
            "warnings": [],
            "artifacts": []
        });
        let errors = validate(SchemaName::WorkerBundleStatus, &doc).unwrap();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn scope_lock_rejects_unknown_property() {
        let doc = json!({
            "allowed_globs": [],
            "blocked_globs": [],
            "allow_shared_paths": [],
            "extra": true
        });
        let errors = validate(SchemaName::ScopeLock, &doc).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn run_ledger_event_enum_rejects_unknown_event_type() {
        let doc = json!({
            "schema_version": 1,
            "ts_utc": "2026-08-01T00:00:00Z",
            "run_id": "r1",
            "event_type": "NOT_A_REAL_EVENT",
            "actor": "A_worker",
            "event_id": "0123456789abcdef",
            "parent_event_id": "",
            "duration_ms": 0,
            "file_counts": {},
            "hashes": {},
            "rc": 0,
            "details": {}
        });
        let errors = validate(SchemaName::RunLedgerEvent, &doc).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn factory_config_allows_partial_override() {
        let doc = json!({ "run": { "branch_prefix": "codex/factory" } });
        let errors = validate(SchemaName::FactoryConfig, &doc).unwrap();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }
}
