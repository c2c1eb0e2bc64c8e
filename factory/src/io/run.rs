//! Run Identity (C6), I/O half: mints a collision-free run id against existing run-state on
//! disk and persists the immutable `RUN_MANIFEST.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};

use crate::core::run_id::{ParsedRunId, next_run_id, short_base_ref_hash};
use crate::io::config::FactoryConfig;
use crate::io::git::Git;
use crate::io::schema::{SchemaName, validate};
use crate::io::util::{iso_utc_now, write_json};

/// Existing run ids, collected from whatever run directories are already on disk. Only the
/// directory name matters; unparseable names are ignored (they cannot collide).
fn existing_run_ids(runs_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(runs_dir) else { return Vec::new() };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| ParsedRunId::parse(name).is_ok())
        .collect()
}

/// Mints the next run id for `kind` against `base_ref`, resolved through `repo`.
pub fn mint_run_id(repo: &Git, runs_dir: &Path, kind: &str, base_ref: &str) -> Result<String> {
    let resolved = repo.rev_parse(base_ref).unwrap_or_else(|_| base_ref.to_string());
    let hash = short_base_ref_hash(&resolved);
    let now = Utc::now();
    let date = now.format("%Y%m%d").to_string();
    let time = now.format("%H%M%S").to_string();
    let existing = existing_run_ids(runs_dir);
    let id = next_run_id(kind, &date, &time, &hash, &existing);
    Ok(id.to_string())
}

#[derive(Debug, Clone)]
pub struct WorktreeManifestEntry {
    pub worker: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: String,
}

/// Writes `<run>/RUN_MANIFEST.json`, refusing to overwrite an existing manifest since the
/// manifest is immutable once created.
pub fn write_run_manifest(
    runs_dir: &Path,
    run_id: &str,
    base_ref: &str,
    base_sha: &str,
    config: &FactoryConfig,
    workers: &[&str],
    worktrees: &[WorktreeManifestEntry],
) -> Result<PathBuf> {
    let path = runs_dir.join(run_id).join("RUN_MANIFEST.json");
    if path.exists() {
        anyhow::bail!("RUN_MANIFEST.json already exists for {run_id}, manifests are immutable");
    }

    let mut worktree_map = serde_json::Map::new();
    for entry in worktrees {
        worktree_map.insert(
            entry.worker.clone(),
            json!({"path": entry.path.display().to_string(), "branch": entry.branch, "status": entry.status}),
        );
    }

    let payload = json!({
        "schema_version": 1,
        "run_id": run_id,
        "base_ref": base_ref,
        "base_sha": base_sha,
        "branch_prefix": config.run.branch_prefix,
        "workers": workers,
        "created_at": iso_utc_now(),
        "worktrees": Value::Object(worktree_map),
        "config_snapshot": serde_json::to_value(config)?,
    });

    let errors = validate(SchemaName::RunManifest, &payload)?;
    if !errors.is_empty() {
        anyhow::bail!("RUN_MANIFEST.json failed schema validation: {}", errors.join("; "));
    }

    write_json(&path, &payload).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn read_run_manifest(runs_dir: &Path, run_id: &str) -> Result<Value> {
    crate::io::util::read_json(&runs_dir.join(run_id).join("RUN_MANIFEST.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn mint_run_id_produces_new_shape() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let repo = Git::new(repo_dir.path());
        let id = mint_run_id(&repo, runs_dir.path(), "factory", "HEAD").unwrap();
        assert!(ParsedRunId::parse(&id).is_ok());
        assert!(id.starts_with("factory_"));
    }

    #[test]
    fn write_run_manifest_rejects_overwrite() {
        let runs_dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        let path = write_run_manifest(
            runs_dir.path(),
            "run-1",
            "HEAD",
            "abcdef1234567890abcdef1234567890abcdef12",
            &config,
            &["A_worker"],
            &[],
        )
        .unwrap();
        assert!(path.exists());
        let err = write_run_manifest(
            runs_dir.path(),
            "run-1",
            "HEAD",
            "abcdef1234567890abcdef1234567890abcdef12",
            &config,
            &["A_worker"],
            &[],
        );
        assert!(err.is_err());
    }
}
