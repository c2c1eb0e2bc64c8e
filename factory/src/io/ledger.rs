//! Event Ledger: a tamper-evident, append-only JSON-lines record of everything the factory does.
//!
//! Every event is validated against the `run_ledger_event` schema before it is appended, the
//! ledger file is re-signed (whole-file sha256) after each write, and readers in strict mode
//! refuse to proceed past a line that fails to parse or validate. This grounds directly on the
//! original `ledger.py`: same normalization defaults, same event-id derivation, same signature
//! scheme.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};

use crate::core::types::{EventType, INTEGRATOR, Status};
use crate::io::lock::acquire_ledger_lock;
use crate::io::schema::{SchemaName, validate};
use crate::io::util::{deep_sort_json, iso_utc_now, sha256_file, stable_sha256_text};

pub fn ledger_path(runs_dir: &Path) -> PathBuf {
    runs_dir.join("factory_ledger.jsonl")
}

pub fn signature_path(runs_dir: &Path) -> PathBuf {
    runs_dir.join("factory_ledger.sha256")
}

fn default_event() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("schema_version".into(), json!(1));
    map.insert("ts_utc".into(), json!(iso_utc_now()));
    map.insert("run_id".into(), json!(""));
    map.insert("event_type".into(), json!("RUN_STATE"));
    map.insert("actor".into(), json!(""));
    map.insert("event_id".into(), json!(""));
    map.insert("parent_event_id".into(), json!(""));
    map.insert("duration_ms".into(), json!(0));
    map.insert("file_counts".into(), json!({}));
    map.insert("hashes".into(), json!({}));
    map.insert("rc".into(), json!(0));
    map.insert("details".into(), json!({}));
    map
}

fn as_str(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn as_object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    }
}

/// Fills in defaults, coerces types, and derives `event_id` when absent — mirrors `_normalize_event`.
fn normalize_event(event: &Value) -> Map<String, Value> {
    let mut payload = default_event();
    if let Value::Object(overrides) = event {
        for (k, v) in overrides {
            payload.insert(k.clone(), v.clone());
        }
    }

    let schema_version = payload
        .get("schema_version")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    payload.insert("schema_version".into(), json!(schema_version));

    let ts_utc = as_str(&payload, "ts_utc");
    let ts_utc = if ts_utc.is_empty() { iso_utc_now() } else { ts_utc };
    payload.insert("ts_utc".into(), json!(ts_utc));

    payload.insert("run_id".into(), json!(as_str(&payload, "run_id").trim()));
    let event_type = as_str(&payload, "event_type").trim().to_ascii_uppercase();
    let event_type = if event_type.is_empty() {
        "RUN_STATE".to_string()
    } else {
        event_type
    };
    payload.insert("event_type".into(), json!(event_type));
    payload.insert("actor".into(), json!(as_str(&payload, "actor").trim()));
    payload.insert(
        "parent_event_id".into(),
        json!(as_str(&payload, "parent_event_id").trim()),
    );

    let duration_ms = payload
        .get("duration_ms")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0);
    payload.insert("duration_ms".into(), json!(duration_ms));

    let rc = payload.get("rc").and_then(Value::as_i64).unwrap_or(0);
    payload.insert("rc".into(), json!(rc));

    payload.insert("hashes".into(), Value::Object(as_object(payload.get("hashes"))));
    payload.insert(
        "file_counts".into(),
        Value::Object(as_object(payload.get("file_counts"))),
    );
    payload.insert(
        "details".into(),
        Value::Object(as_object(payload.get("details"))),
    );

    let event_id = as_str(&payload, "event_id").trim().to_string();
    let event_id = if event_id.is_empty() {
        derive_event_id(&payload)
    } else {
        event_id
    };
    payload.insert("event_id".into(), json!(event_id));
    payload
}

/// `sha256(run_id|event_type|actor|ts_utc|details|parent_event_id)[:16]`, matching the Python
/// implementation's sorted-key JSON seed rather than a literal pipe-joined string.
fn derive_event_id(payload: &Map<String, Value>) -> String {
    let seed = json!({
        "run_id": payload.get("run_id").cloned().unwrap_or(Value::Null),
        "event_type": payload.get("event_type").cloned().unwrap_or(Value::Null),
        "actor": payload.get("actor").cloned().unwrap_or(Value::Null),
        "ts_utc": payload.get("ts_utc").cloned().unwrap_or(Value::Null),
        "details": payload.get("details").cloned().unwrap_or(Value::Null),
        "parent_event_id": payload.get("parent_event_id").cloned().unwrap_or(Value::Null),
    });
    let sorted = deep_sort_json(&seed);
    let seed_text = serde_json::to_string(&sorted).unwrap_or_default();
    stable_sha256_text(&seed_text)[..16].to_string()
}

fn validate_event(payload: &Value) -> Result<()> {
    let errors = validate(SchemaName::RunLedgerEvent, payload)?;
    if !errors.is_empty() {
        bail!("ledger event payload invalid:\n{}", errors.join("\n"));
    }
    Ok(())
}

fn write_signature(runs_dir: &Path) -> Result<()> {
    let ledger = ledger_path(runs_dir);
    let sig = signature_path(runs_dir);
    if let Some(parent) = sig.parent() {
        fs::create_dir_all(parent)?;
    }
    if !ledger.exists() {
        fs::write(&sig, "")?;
        return Ok(());
    }
    let digest = sha256_file(&ledger)?;
    let name = ledger.file_name().and_then(|n| n.to_str()).unwrap_or("");
    fs::write(&sig, format!("{digest}  {name}\n"))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSignatureStatus {
    pub status: Status,
    pub detail: String,
    pub ledger: PathBuf,
    pub signature: PathBuf,
}

/// Recomputes the ledger file's sha256 and compares it against the recorded signature file.
pub fn verify_ledger_signature(runs_dir: &Path) -> LedgerSignatureStatus {
    let ledger = ledger_path(runs_dir);
    let sig = signature_path(runs_dir);
    if !ledger.exists() {
        return LedgerSignatureStatus {
            status: Status::Blocked,
            detail: "ledger missing".to_string(),
            ledger,
            signature: sig,
        };
    }
    if !sig.exists() {
        return LedgerSignatureStatus {
            status: Status::Blocked,
            detail: "signature missing".to_string(),
            ledger,
            signature: sig,
        };
    }
    let expected = sha256_file(&ledger).unwrap_or_default();
    let actual = fs::read_to_string(&sig)
        .ok()
        .and_then(|line| line.trim().split("  ").next().map(str::to_string))
        .unwrap_or_default();
    let status = if expected == actual && !expected.is_empty() {
        Status::Pass
    } else {
        Status::Blocked
    };
    LedgerSignatureStatus {
        status,
        detail: if status == Status::Pass { "signature matches".to_string() } else { "signature mismatch".to_string() },
        ledger,
        signature: sig,
    }
}

/// Appends `event` to the ledger under the exclusive ledger lock, returning the normalized,
/// validated payload actually written (including its derived `event_id`).
pub fn append_event(runs_dir: &Path, owner: &str, event: &Value) -> Result<Value> {
    let payload = normalize_event(event);
    let value = Value::Object(payload);
    validate_event(&value)?;

    let _lock = acquire_ledger_lock(runs_dir, owner)?;
    let path = ledger_path(runs_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create ledger directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open ledger {}", path.display()))?;
    let line = serde_json::to_string(&deep_sort_json(&value))?;
    writeln!(file, "{line}").with_context(|| format!("append to ledger {}", path.display()))?;
    write_signature(runs_dir)?;
    Ok(value)
}

/// Convenience wrapper for an append with a typed `EventType`.
pub fn append_typed_event(
    runs_dir: &Path,
    owner: &str,
    run_id: &str,
    event_type: EventType,
    actor: &str,
    details: Value,
) -> Result<Value> {
    append_event(
        runs_dir,
        owner,
        &json!({
            "run_id": run_id,
            "event_type": event_type.as_str(),
            "actor": actor,
            "details": details,
        }),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptLedgerError(String);

impl std::fmt::Display for CorruptLedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CorruptLedgerError {}

/// Reads every event from the ledger. In strict mode (the default for anything that feeds a
/// report), a malformed or schema-invalid line aborts with [`CorruptLedgerError`]; in non-strict
/// mode such lines are skipped, which is useful for best-effort diagnostics tooling like `doctor`.
pub fn read_events(runs_dir: &Path, strict: bool) -> Result<Vec<Value>> {
    let path = ledger_path(runs_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut parsed = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let item: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(err) => {
                if strict {
                    return Err(CorruptLedgerError(format!(
                        "invalid ledger json at line {line_no}: {err}"
                    ))
                    .into());
                }
                continue;
            }
        };
        if !item.is_object() {
            if strict {
                return Err(CorruptLedgerError(format!(
                    "invalid ledger line #{line_no}: expected JSON object"
                ))
                .into());
            }
            continue;
        }
        let normalized = normalize_event(&item);
        let value = Value::Object(normalized);
        if let Err(err) = validate_event(&value) {
            if strict {
                return Err(CorruptLedgerError(format!(
                    "invalid ledger payload at line {line_no}: {err}"
                ))
                .into());
            }
            continue;
        }
        let mut with_line = value;
        with_line
            .as_object_mut()
            .expect("validated as object")
            .insert("_line".into(), json!(line_no));
        parsed.push(with_line);
    }
    Ok(parsed)
}

/// Filters for [`query_events`]. All fields are optional; `None` means "don't filter on this".
#[derive(Debug, Default, Clone)]
pub struct EventQuery<'a> {
    pub run_id: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub actor: Option<&'a str>,
    pub rc: Option<i64>,
    pub since: Option<&'a str>,
    pub status: Option<&'a str>,
    pub kind: Option<&'a str>,
    pub limit: usize,
}

impl<'a> EventQuery<'a> {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Filters, sorts (ts_utc, event_type, run_id, actor, line), and tail-limits the ledger.
pub fn query_events(runs_dir: &Path, query: &EventQuery) -> Result<Vec<Value>> {
    let mut items = read_events(runs_dir, true)?;
    items.retain(|entry| {
        let obj = entry.as_object().expect("events are objects");
        if let Some(run_id) = query.run_id
            && as_str(obj, "run_id") != run_id
        {
            return false;
        }
        if let Some(event_type) = query.event_type
            && as_str(obj, "event_type") != event_type
        {
            return false;
        }
        if let Some(actor) = query.actor
            && as_str(obj, "actor") != actor
        {
            return false;
        }
        if let Some(rc) = query.rc
            && obj.get("rc").and_then(Value::as_i64).unwrap_or(0) != rc
        {
            return false;
        }
        if let Some(since) = query.since
            && as_str(obj, "ts_utc").as_str() < since
        {
            return false;
        }
        if let Some(status) = query.status {
            let details = as_object(obj.get("details"));
            if as_str(&details, "status") != status {
                return false;
            }
        }
        if let Some(kind) = query.kind {
            let details = as_object(obj.get("details"));
            if as_str(&details, "kind") != kind {
                return false;
            }
        }
        true
    });

    items.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let cap = query.limit.max(1);
    if items.len() > cap {
        let start = items.len() - cap;
        items = items[start..].to_vec();
    }
    Ok(items)
}

fn sort_key(value: &Value) -> (String, String, String, String, i64) {
    let obj = value.as_object().cloned().unwrap_or_default();
    (
        as_str(&obj, "ts_utc"),
        as_str(&obj, "event_type"),
        as_str(&obj, "run_id"),
        as_str(&obj, "actor"),
        obj.get("_line").and_then(Value::as_i64).unwrap_or(0),
    )
}

/// Per-run state reconstructed by replaying the ledger from scratch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunReplay {
    pub run_id: String,
    pub event_count: usize,
    pub last_event_type: String,
    pub started_at: String,
    pub ended_at: String,
    pub actors: Vec<String>,
    pub status: Option<String>,
    pub rc: i64,
}

/// Reconstructs per-run state by walking the whole ledger in sorted order: event count, the
/// last event type seen, first/last timestamps, the distinct actors involved, and the terminal
/// status/rc carried by the most recent event whose `details.status` is set.
pub fn replay_runs(runs_dir: &Path) -> Result<Vec<RunReplay>> {
    let mut events = read_events(runs_dir, true)?;
    events.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let mut order: Vec<String> = Vec::new();
    let mut by_run: std::collections::HashMap<String, Vec<&Value>> = std::collections::HashMap::new();
    for event in &events {
        let obj = event.as_object().expect("events are objects");
        let run_id = as_str(obj, "run_id");
        if run_id.is_empty() {
            continue;
        }
        if !by_run.contains_key(&run_id) {
            order.push(run_id.clone());
        }
        by_run.entry(run_id).or_default().push(event);
    }

    let mut replays = Vec::new();
    for run_id in order {
        let run_events = &by_run[&run_id];
        let mut actors = std::collections::BTreeSet::new();
        let mut status = None;
        let mut rc = 0i64;
        for event in run_events {
            let obj = event.as_object().expect("events are objects");
            let actor = as_str(obj, "actor");
            if !actor.is_empty() {
                actors.insert(actor);
            }
            let details = as_object(obj.get("details"));
            if let Some(s) = details.get("status").and_then(Value::as_str) {
                status = Some(s.to_string());
                rc = obj.get("rc").and_then(Value::as_i64).unwrap_or(0);
            }
        }
        let first = run_events.first().expect("non-empty").as_object().expect("object");
        let last = run_events.last().expect("non-empty").as_object().expect("object");
        replays.push(RunReplay {
            run_id,
            event_count: run_events.len(),
            last_event_type: as_str(last, "event_type"),
            started_at: as_str(first, "ts_utc"),
            ended_at: as_str(last, "ts_utc"),
            actors: actors.into_iter().collect(),
            status,
            rc,
        });
    }
    Ok(replays)
}

/// Every distinct `run_id` that appears in the ledger, sorted.
pub fn query_run_ids(runs_dir: &Path) -> Result<Vec<String>> {
    let events = read_events(runs_dir, true)?;
    let mut ids: Vec<String> = events
        .iter()
        .filter_map(|e| e.as_object())
        .map(|o| as_str(o, "run_id"))
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// Appends a `RUN_STATE`-shaped terminal-status record, applying the rc-authoritative override:
/// a `BLOCKED` status with `rc == 0` is corrected to `rc = 2` before the event is written.
pub fn append_run(runs_dir: &Path, owner: &str, record: &Value) -> Result<Value> {
    let obj = record.as_object().cloned().unwrap_or_default();
    let status = as_str(&obj, "status").to_ascii_uppercase();
    let parsed_status = match status.as_str() {
        "PASS" => Status::Pass,
        "BLOCKED" => Status::Blocked,
        "FAIL" => Status::Fail,
        "WARN" => Status::Warn,
        "PENDING" => Status::Pending,
        _ => Status::Pass,
    };
    let mut rc = obj
        .get("rc")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| parsed_status.exit_code() as i64);
    if parsed_status == Status::Blocked && rc == 0 {
        rc = 2;
    }

    let event_type = {
        let raw = as_str(&obj, "event_type");
        if raw.is_empty() { "RUN_STATE".to_string() } else { raw }
    };
    let actor = {
        let raw = as_str(&obj, "actor");
        if raw.is_empty() { INTEGRATOR.to_string() } else { raw }
    };

    append_event(
        runs_dir,
        owner,
        &json!({
            "schema_version": 1,
            "ts_utc": as_str(&obj, "ts_utc"),
            "run_id": as_str(&obj, "run_id"),
            "event_type": event_type,
            "actor": actor,
            "event_id": as_str(&obj, "event_id"),
            "parent_event_id": as_str(&obj, "parent_event_id"),
            "duration_ms": obj.get("duration_ms").and_then(Value::as_i64).unwrap_or(0),
            "file_counts": obj.get("file_counts").cloned().unwrap_or(json!({})),
            "hashes": obj.get("hashes").cloned().unwrap_or(json!({})),
            "rc": rc,
            "details": obj.get("details").cloned().unwrap_or(json!({})),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let event = append_typed_event(
            dir.path(),
            "tester",
            "run-1",
            EventType::RunStart,
            "Z_integrator",
            json!({"note": "go"}),
        )
        .unwrap();
        assert_eq!(event["run_id"], "run-1");
        assert!(!event["event_id"].as_str().unwrap().is_empty());

        let events = read_events(dir.path(), true).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "RUN_START");
    }

    #[test]
    fn verify_ledger_signature_passes_after_append() {
        let dir = tempdir().unwrap();
        append_typed_event(dir.path(), "tester", "run-1", EventType::RunStart, "a", json!({})).unwrap();
        let status = verify_ledger_signature(dir.path());
        assert_eq!(status.status, Status::Pass);
    }

    #[test]
    fn verify_ledger_signature_blocked_when_missing() {
        let dir = tempdir().unwrap();
        let status = verify_ledger_signature(dir.path());
        assert_eq!(status.status, Status::Blocked);
    }

    #[test]
    fn signature_file_tracks_ledger_contents() {
        let dir = tempdir().unwrap();
        append_typed_event(dir.path(), "tester", "run-1", EventType::RunStart, "a", json!({})).unwrap();
        let sig = fs::read_to_string(signature_path(dir.path())).unwrap();
        let digest = sha256_file(&ledger_path(dir.path())).unwrap();
        assert!(sig.starts_with(&digest));
    }

    #[test]
    fn missing_event_id_is_derived_deterministically() {
        let dir = tempdir().unwrap();
        let event = json!({"run_id": "r", "event_type": "RUN_START", "actor": "a", "ts_utc": "2026-01-01T00:00:00.000Z"});
        let first = append_event(dir.path(), "t", &event).unwrap();
        fs::remove_file(ledger_path(dir.path())).unwrap();
        let second = append_event(dir.path(), "t", &event).unwrap();
        assert_eq!(first["event_id"], second["event_id"]);
        assert_eq!(first["event_id"].as_str().unwrap().len(), 16);
    }

    #[test]
    fn read_events_strict_fails_on_malformed_line() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(ledger_path(dir.path()), "not json\n").unwrap();
        assert!(read_events(dir.path(), true).is_err());
        assert!(read_events(dir.path(), false).unwrap().is_empty());
    }

    #[test]
    fn append_run_promotes_blocked_zero_rc_to_two() {
        let dir = tempdir().unwrap();
        let record = json!({"run_id": "r", "status": "BLOCKED", "rc": 0});
        let event = append_run(dir.path(), "t", &record).unwrap();
        assert_eq!(event["rc"], 2);
    }

    #[test]
    fn query_events_filters_by_run_id_and_limits() {
        let dir = tempdir().unwrap();
        append_typed_event(dir.path(), "t", "r1", EventType::RunStart, "a", json!({})).unwrap();
        append_typed_event(dir.path(), "t", "r2", EventType::RunStart, "a", json!({})).unwrap();
        let results = query_events(dir.path(), &EventQuery { run_id: Some("r1"), limit: 10, ..Default::default() }).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["run_id"], "r1");
    }

    #[test]
    fn replay_runs_reconstructs_terminal_status_and_actors() {
        let dir = tempdir().unwrap();
        append_typed_event(dir.path(), "t", "r1", EventType::RunStart, "factory-cli", json!({})).unwrap();
        append_typed_event(
            dir.path(),
            "t",
            "r1",
            EventType::RunEnd,
            "Z_integrator",
            json!({"status": "PASS"}),
        )
        .unwrap();

        let replays = replay_runs(dir.path()).unwrap();
        assert_eq!(replays.len(), 1);
        let run = &replays[0];
        assert_eq!(run.run_id, "r1");
        assert_eq!(run.event_count, 2);
        assert_eq!(run.last_event_type, "RUN_END");
        assert_eq!(run.actors, vec!["Z_integrator".to_string(), "factory-cli".to_string()]);
        assert_eq!(run.status.as_deref(), Some("PASS"));
        assert_eq!(run.rc, 0);
        assert!(!run.started_at.is_empty());
        assert!(!run.ended_at.is_empty());
    }

    #[test]
    fn query_run_ids_is_sorted_and_deduplicated() {
        let dir = tempdir().unwrap();
        append_typed_event(dir.path(), "t", "r2", EventType::RunStart, "a", json!({})).unwrap();
        append_typed_event(dir.path(), "t", "r1", EventType::RunStart, "a", json!({})).unwrap();
        append_typed_event(dir.path(), "t", "r1", EventType::RunEnd, "a", json!({})).unwrap();
        assert_eq!(query_run_ids(dir.path()).unwrap(), vec!["r1".to_string(), "r2".to_string()]);
    }
}
