//! I/O half of the Meaningful Gate (C10): collects `FILES_CHANGED.json`, `DIFF.patch`, and git
//! state for a run, then hands them to [`crate::core::meaningful_gate::evaluate`].

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::meaningful_gate::{DeclaredChange, FailMode, GateInputs, GateVerdict, NoopDeclaration, evaluate};
use crate::core::types::{INTEGRATOR, Status};
use crate::io::git::Git;
use crate::io::util::{read_json, write_json, write_text};

pub(crate) fn canonical_path(raw: &str) -> String {
    raw.trim().replace('\\', "/").trim_matches('/').to_string()
}

pub(crate) fn parse_patch_paths(diff_text: &str) -> Vec<String> {
    let mut paths = std::collections::BTreeSet::new();
    for line in diff_text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 2 {
                let left = parts[0].strip_prefix("a/").unwrap_or(parts[0]);
                let right = parts[1].strip_prefix("b/").unwrap_or(parts[1]);
                let chosen = if left == "/dev/null" {
                    right
                } else {
                    right
                };
                let normalized = canonical_path(chosen);
                if !normalized.is_empty() {
                    paths.insert(normalized);
                }
            }
            continue;
        }
        if let Some(candidate) = line.strip_prefix("+++ b/").or_else(|| line.strip_prefix("--- a/")) {
            if candidate.trim() == "/dev/null" {
                continue;
            }
            let normalized = canonical_path(candidate);
            if !normalized.is_empty() {
                paths.insert(normalized);
            }
        }
    }
    paths.into_iter().collect()
}

fn collect_git_paths(repo: &Git, runs_prefix: &str, base_ref: &str) -> (Vec<String>, Vec<String>) {
    let mut notes = Vec::new();
    let mut merged = std::collections::BTreeSet::new();

    let head = match repo.rev_parse("HEAD") {
        Ok(sha) => sha,
        Err(_) => {
            notes.push("HEAD is not available.".to_string());
            return (Vec::new(), notes);
        }
    };

    if let Ok(entries) = repo.status_porcelain() {
        for entry in entries {
            merged.insert(canonical_path(&entry.path));
        }
    } else {
        notes.push("git status --porcelain failed.".to_string());
    }

    match repo.diff_name_status(base_ref, &head) {
        Ok(changes) => {
            for (_, path) in changes {
                merged.insert(canonical_path(&path));
            }
        }
        Err(_) => {
            notes.push(format!("git diff --name-status {base_ref}..{head} failed."));
        }
    }

    let filtered: Vec<String> = merged
        .into_iter()
        .filter(|p| p != runs_prefix && !p.starts_with(&format!("{runs_prefix}/")))
        .collect();
    (filtered, notes)
}

fn build_markdown(payload: &Value) -> String {
    let fail_modes: Vec<String> = payload["fail_modes"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let stats = &payload["stats"];
    let mut lines = vec![
        "# VERIFY_MEANINGFUL_GATE".to_string(),
        String::new(),
        format!("- Verdict: `{}`", payload["verdict"].as_str().unwrap_or("BLOCKED")),
        format!("- NOOP: `{}`", payload["noop"].as_bool().unwrap_or(false)),
        format!("- Fail modes: `{}`", if fail_modes.is_empty() { "<none>".to_string() } else { fail_modes.join(", ") }),
        String::new(),
        "## Stats".to_string(),
        format!("- changed_files_count: `{}`", stats["changed_files_count"]),
        format!("- diff_bytes: `{}`", stats["diff_bytes"]),
        format!("- declared_paths_count: `{}`", stats["declared_paths_count"]),
        format!("- git_paths_count: `{}`", stats["git_paths_count"]),
        String::new(),
        "## Samples (up to 10)".to_string(),
    ];
    let samples = payload["samples"].as_array().cloned().unwrap_or_default();
    if samples.is_empty() {
        lines.push("- <none>".to_string());
    } else {
        for sample in samples {
            lines.push(format!("- `{}`", sample.as_str().unwrap_or_default()));
        }
    }
    lines.join("\n").trim_end().to_string() + "\n"
}

pub struct MeaningfulGateReport {
    pub run_id: String,
    pub verdict: GateVerdict,
    pub payload: Value,
}

/// Runs the meaningful-execution gate for `run_id` and, if the run directory exists, writes
/// `VERIFY_MEANINGFUL_GATE.{json,md}` at the run root.
pub fn run_meaningful_gate(repo_root: &Path, runs_dir: &Path, run_id: &str) -> Result<MeaningfulGateReport> {
    let run_dir = runs_dir.join(run_id);
    let integrator_dir = run_dir.join(INTEGRATOR);
    let files_changed_path = integrator_dir.join("FILES_CHANGED.json");
    let diff_path = integrator_dir.join("DIFF.patch");
    let manifest_path = run_dir.join("RUN_MANIFEST.json");

    let mut notes = Vec::new();
    let mut blocked = !run_dir.exists();
    if blocked {
        notes.push(format!("run directory missing: {}", run_dir.display()));
    }

    let base_ref = if manifest_path.exists() {
        read_json(&manifest_path)
            .ok()
            .and_then(|v| v["base_ref"].as_str().map(String::from))
            .unwrap_or_else(|| "HEAD".to_string())
    } else {
        notes.push("RUN_MANIFEST.json is missing; base_ref fallback to HEAD.".to_string());
        "HEAD".to_string()
    };

    let mut files_changed = Value::Null;
    if files_changed_path.exists() {
        match read_json(&files_changed_path) {
            Ok(v) => files_changed = v,
            Err(_) => {
                blocked = true;
                notes.push(format!("FILES_CHANGED.json is unreadable: {}", files_changed_path.display()));
            }
        }
    } else {
        notes.push("FILES_CHANGED.json is missing.".to_string());
    }

    let diff_text = if diff_path.exists() {
        std::fs::read_to_string(&diff_path).unwrap_or_default()
    } else {
        notes.push("DIFF.patch is missing.".to_string());
        String::new()
    };

    let changes_raw = files_changed["changes"].as_array().cloned().unwrap_or_default();
    let mut declared: Vec<DeclaredChange> = Vec::new();
    for entry in &changes_raw {
        let path = canonical_path(entry["path"].as_str().unwrap_or_default());
        if path.is_empty() {
            continue;
        }
        let change_type = entry["change_type"].as_str().unwrap_or("modified").to_lowercase();
        let exists_on_disk = repo_root.join(&path).exists();
        declared.push(DeclaredChange { path, change_type, exists_on_disk });
    }
    declared.sort_by(|a, b| a.path.cmp(&b.path));

    let noop_reason = files_changed["noop_reason"].as_str().unwrap_or_default().trim().to_string();
    let noop_ack = files_changed["noop_ack"].as_str().unwrap_or_default().trim().to_string();
    let noop_flag = files_changed["noop"].as_bool().unwrap_or(false);
    let noop_declaration = NoopDeclaration { reason: noop_reason.clone(), ack: noop_ack.clone() };
    let noop = if noop_flag { Some(&noop_declaration) } else { None };

    let repo = Git::new(repo_root);
    let runs_prefix = canonical_path(&runs_dir_prefix(repo_root, runs_dir));
    let (git_paths, git_notes) = collect_git_paths(&repo, &runs_prefix, &base_ref);
    notes.extend(git_notes);

    let patch_paths = parse_patch_paths(&diff_text);

    let patch_applies = if diff_text.trim().is_empty() {
        false
    } else {
        repo.apply_check(&diff_text, false).unwrap_or(false) || repo.apply_check(&diff_text, true).unwrap_or(false)
    };

    let inputs = GateInputs {
        declared: &declared,
        noop,
        diff_is_empty: diff_text.trim().is_empty(),
        patch_paths: &patch_paths,
        git_paths: &git_paths,
        patch_applies,
    };
    let mut verdict = evaluate(&inputs);
    if blocked {
        verdict.status = Status::Blocked;
    }

    let declared_paths: Vec<String> = declared.iter().map(|d| d.path.clone()).collect();
    let phantom_paths: Vec<String> = declared
        .iter()
        .filter(|d| (d.change_type != "deleted") != d.exists_on_disk)
        .map(|d| d.path.clone())
        .collect();

    let payload = json!({
        "schema_version": 1,
        "run_id": run_id,
        "verdict": verdict.status.to_string(),
        "fail_modes": verdict.fail_modes.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        "noop": verdict.noop,
        "noop_reason": if verdict.noop { noop_reason } else { String::new() },
        "noop_ack": if verdict.noop { noop_ack } else { String::new() },
        "stats": {
            "changed_files_count": declared.len(),
            "diff_bytes": diff_text.as_bytes().len(),
            "declared_paths_count": declared_paths.len(),
            "git_paths_count": git_paths.len(),
        },
        "samples": declared_paths.iter().chain(patch_paths.iter()).chain(git_paths.iter()).cloned().collect::<std::collections::BTreeSet<_>>().into_iter().take(10).collect::<Vec<_>>(),
        "details": {
            "declared_paths": declared_paths,
            "patch_paths": patch_paths,
            "git_paths": git_paths,
            "phantom_paths": phantom_paths,
            "patch_applies": patch_applies,
            "notes": notes,
        },
    });

    if run_dir.exists() {
        write_json(&run_dir.join("VERIFY_MEANINGFUL_GATE.json"), &payload)?;
        write_text(&run_dir.join("VERIFY_MEANINGFUL_GATE.md"), &build_markdown(&payload))?;
    }

    Ok(MeaningfulGateReport { run_id: run_id.to_string(), verdict, payload })
}

fn runs_dir_prefix(repo_root: &Path, runs_dir: &Path) -> String {
    runs_dir
        .strip_prefix(repo_root)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "tools/codex/runs".to_string())
}

#[allow(dead_code)]
fn fail_mode_names(modes: &[FailMode]) -> Vec<&'static str> {
    modes.iter().map(|m| m.as_str()).collect()
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
    fn missing_run_dir_is_blocked() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let report = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-missing").unwrap();
        assert_eq!(report.verdict.status, Status::Blocked);
    }

    #[test]
    fn empty_declarations_and_patch_fail() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let run_dir = runs_dir.path().join("run-1").join(INTEGRATOR);
        std::fs::create_dir_all(&run_dir).unwrap();
        let report = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
        assert_eq!(report.verdict.status, Status::Fail);
        assert!(report.verdict.fail_modes.contains(&FailMode::EmptyDeclarations));
        assert!(report.verdict.fail_modes.contains(&FailMode::EmptyPatch));
    }

    #[test]
    fn noop_declaration_passes_without_changes() {
        let repo_dir = tempdir().unwrap();
        init_git_repo(repo_dir.path());
        let runs_dir = tempdir().unwrap();
        let run_dir = runs_dir.path().join("run-1");
        let integrator_dir = run_dir.join(INTEGRATOR);
        std::fs::create_dir_all(&integrator_dir).unwrap();
        write_json(
            &integrator_dir.join("FILES_CHANGED.json"),
            &json!({"changes": [], "noop": true, "noop_reason": "nothing to do", "noop_ack": "confirmed"}),
        )
        .unwrap();
        write_text(&integrator_dir.join("DIFF.patch"), "").unwrap();
        let report = run_meaningful_gate(repo_dir.path(), runs_dir.path(), "run-1").unwrap();
        assert_eq!(report.verdict.status, Status::Pass);
        assert!(report.verdict.noop);
    }
}
