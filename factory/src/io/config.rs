//! Factory configuration, stored at `tools/codex/factory.config.json`.
//!
//! Resolution layers four sources in increasing priority: built-in defaults, the config file,
//! `FACTORY_`-prefixed environment variables, and CLI overrides. Each layer is deep-merged as a
//! JSON value before the result is deserialized into [`FactoryConfig`], matching the override
//! precedence described in the original Python `config.py`.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::WORKERS;
use crate::io::util::{read_json, write_json};

pub const ENV_PREFIX: &str = "FACTORY_";
const IGNORED_ENV_KEYS: &[&str] = &["FACTORY_AHK_EXE", "FACTORY_WORKTREE_MODE"];
const IGNORED_ENV_PREFIXES: &[&str] = &["FACTORY_DISPATCH__"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub kind: String,
    pub run_prefix: String,
    pub branch_prefix: String,
    pub base_ref: String,
    pub strict_collision_mode: bool,
    pub allow_identical_patch_overlap: bool,
    pub quarantine_on_suspicious_bundle: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kind: "factory".to_string(),
            run_prefix: "factory".to_string(),
            branch_prefix: "codex/factory".to_string(),
            base_ref: "HEAD".to_string(),
            strict_collision_mode: true,
            allow_identical_patch_overlap: false,
            quarantine_on_suspicious_bundle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub repo_root: String,
    pub runs_dir: String,
    pub worktrees_dir: String,
    pub worktree_mode: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repo_root: ".".to_string(),
            runs_dir: "tools/codex/runs".to_string(),
            worktrees_dir: "tools/codex/worktrees".to_string(),
            worktree_mode: "fixed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Shell command template. `{worker}`, `{worktree}`, `{prompt}`, `{run_id}` are substituted.
    pub worker_launch_command: String,
    pub window_ready_timeout_seconds: u32,
    pub readiness_timeout_seconds: u32,
    pub between_workers_delay_ms: u32,
    pub poll_interval_ms: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_launch_command: String::new(),
            window_ready_timeout_seconds: 120,
            readiness_timeout_seconds: 25,
            between_workers_delay_ms: 700,
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    pub required_worker_files: Vec<String>,
    pub required_integrator_files: Vec<String>,
    pub allowlist_globs: BTreeMap<String, Vec<String>>,
    pub denylist_globs: BTreeMap<String, Vec<String>>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let default_allow = vec!["apps/**".to_string(), "packages/**".to_string(), "docs/**".to_string()];
        let default_deny = vec![
            ".github/workflows/**".to_string(),
            ".git/**".to_string(),
            ".env".to_string(),
            ".env.*".to_string(),
        ];
        let mut allowlist_globs = BTreeMap::new();
        let mut denylist_globs = BTreeMap::new();
        for worker in WORKERS {
            allowlist_globs.insert(worker.to_string(), default_allow.clone());
            denylist_globs.insert(worker.to_string(), default_deny.clone());
        }
        Self {
            required_worker_files: vec![
                "STATUS.json".to_string(),
                "SUMMARY.md".to_string(),
                "FILES_CHANGED.json".to_string(),
                "DIFF.patch".to_string(),
                "SUGGESTIONS.md".to_string(),
                "SCOPE_LOCK.json".to_string(),
                "HANDOFF_NOTE.json".to_string(),
                "LOGS/INDEX.json".to_string(),
            ],
            required_integrator_files: vec![
                "STATUS.json".to_string(),
                "FINAL_REPORT.txt".to_string(),
                "FILES_CHANGED.json".to_string(),
                "DIFF.patch".to_string(),
                "MERGE_PLAN.md".to_string(),
                "LOGS/INDEX.json".to_string(),
            ],
            allowlist_globs,
            denylist_globs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub allow_shell_execution: bool,
    pub allow_executable_artifacts: bool,
    pub secret_scan_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_shell_execution: false,
            allow_executable_artifacts: false,
            secret_scan_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_identical_patch_overlap: bool,
    pub enable_quarantine: bool,
    pub enable_ledger_compaction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FactoryConfig {
    pub schema_version: u32,
    pub contract_version: u32,
    pub run: RunConfig,
    pub paths: PathsConfig,
    pub workers: WorkersConfig,
    pub security: SecurityConfig,
    pub feature_flags: FeatureFlags,
    pub dispatch: DispatchConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            schema_version: 2,
            contract_version: 2,
            run: RunConfig::default(),
            paths: PathsConfig::default(),
            workers: WorkersConfig::default(),
            security: SecurityConfig::default(),
            feature_flags: FeatureFlags::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl FactoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.branch_prefix.trim().is_empty() {
            bail!("run.branch_prefix must not be empty");
        }
        if self.paths.runs_dir.trim().is_empty() {
            bail!("paths.runs_dir must not be empty");
        }
        if self.paths.worktree_mode != "fixed" {
            bail!(
                "paths.worktree_mode must be \"fixed\", got {:?}",
                self.paths.worktree_mode
            );
        }
        if self.workers.required_worker_files.is_empty() {
            bail!("workers.required_worker_files must not be empty");
        }
        Ok(())
    }

    pub fn runs_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.runs_dir)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.worktrees_dir)
    }
}

fn default_config_value() -> Value {
    serde_json::to_value(FactoryConfig::default()).expect("default config always serializes")
}

fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = serde_json::Map::new();
            let mut keys: Vec<&String> = base_map.keys().chain(overlay_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                match (base_map.get(key), overlay_map.get(key)) {
                    (Some(l), Some(r)) => {
                        merged.insert(key.clone(), deep_merge(l, r));
                    }
                    (None, Some(r)) => {
                        merged.insert(key.clone(), r.clone());
                    }
                    (Some(l), None) => {
                        merged.insert(key.clone(), l.clone());
                    }
                    (None, None) => {}
                }
            }
            Value::Object(merged)
        }
        (_, overlay_value) => overlay_value.clone(),
    }
}

fn coerce_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(n.into());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn set_nested(payload: &mut serde_json::Map<String, Value>, dotted_key: &str, value: Value) {
    let parts: Vec<&str> = dotted_key.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return;
    }
    let mut cursor = payload;
    for part in &parts[..parts.len() - 1] {
        let entry = cursor
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        cursor = entry.as_object_mut().expect("just ensured object");
    }
    cursor.insert(parts[parts.len() - 1].to_string(), value);
}

/// Builds an override JSON value from `FACTORY_`-prefixed environment variables.
/// `FACTORY_RUN__BASE_REF=main` becomes `{"run": {"base_ref": "main"}}`.
fn env_to_config(env_vars: &BTreeMap<String, String>) -> Value {
    let mut overlay = serde_json::Map::new();
    for (key, raw_value) in env_vars {
        if !key.starts_with(ENV_PREFIX) {
            continue;
        }
        if IGNORED_ENV_KEYS.contains(&key.as_str()) {
            continue;
        }
        if IGNORED_ENV_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
        {
            continue;
        }
        let dotted = key[ENV_PREFIX.len()..].to_ascii_lowercase().replace("__", ".");
        set_nested(&mut overlay, &dotted, coerce_scalar(raw_value));
    }
    Value::Object(overlay)
}

fn current_env_vars() -> BTreeMap<String, String> {
    env::vars().collect()
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("tools/codex/factory.config.json")
}

pub fn load_config_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let value = read_json(path)?;
    if !value.is_object() {
        bail!("factory config must be a JSON object: {}", path.display());
    }
    Ok(value)
}

/// Resolves the final configuration by layering defaults, file, environment, and CLI overrides.
pub fn load_factory_config(
    config_path: Option<&Path>,
    cli_overrides: Option<&Value>,
) -> Result<FactoryConfig> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    let file_payload = load_config_file(&path)?;
    let env_payload = env_to_config(&current_env_vars());
    let cli_payload = cli_overrides.cloned().unwrap_or(Value::Object(serde_json::Map::new()));

    let merged = deep_merge(&default_config_value(), &file_payload);
    let merged = deep_merge(&merged, &env_payload);
    let merged = deep_merge(&merged, &cli_payload);

    let cfg: FactoryConfig = serde_json::from_value(merged)
        .with_context(|| format!("deserialize merged config from {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Writes the default configuration to `path` if it does not already exist.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_json(path, &default_config_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FactoryConfig::default().validate().unwrap();
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let cfg = load_factory_config(Some(&temp.path().join("missing.json")), None).unwrap();
        assert_eq!(cfg, FactoryConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        write_json(&path, &serde_json::json!({"run": {"base_ref": "main"}})).unwrap();
        let cfg = load_factory_config(Some(&path), None).unwrap();
        assert_eq!(cfg.run.base_ref, "main");
        assert_eq!(cfg.run.branch_prefix, "codex/factory");
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        write_json(&path, &serde_json::json!({"run": {"base_ref": "main"}})).unwrap();
        let cli = serde_json::json!({"run": {"base_ref": "cli-ref"}});
        let cfg = load_factory_config(Some(&path), Some(&cli)).unwrap();
        assert_eq!(cfg.run.base_ref, "cli-ref");
    }

    #[test]
    fn env_to_config_splits_double_underscore_into_nesting() {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("FACTORY_RUN__BASE_REF".to_string(), "develop".to_string());
        env_vars.insert("FACTORY_WORKTREE_MODE".to_string(), "ignored".to_string());
        let overlay = env_to_config(&env_vars);
        assert_eq!(overlay["run"]["base_ref"], Value::String("develop".to_string()));
        assert!(overlay.get("worktree_mode").is_none());
    }

    #[test]
    fn coerce_scalar_parses_bool_and_int() {
        assert_eq!(coerce_scalar("true"), Value::Bool(true));
        assert_eq!(coerce_scalar("42"), Value::Number(42.into()));
        assert_eq!(coerce_scalar("plain"), Value::String("plain".to_string()));
    }

    #[test]
    fn write_default_config_does_not_clobber_existing() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        write_json(&path, &serde_json::json!({"run": {"base_ref": "custom"}})).unwrap();
        write_default_config(&path).unwrap();
        let value = read_json(&path).unwrap();
        assert_eq!(value["run"]["base_ref"], Value::String("custom".to_string()));
    }
}
