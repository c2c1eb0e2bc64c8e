//! sha256 manifest generation for a run's bundles, ledger, and final report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::ledger::ledger_path;
use crate::io::util::sha256_file;

fn iter_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort_by_key(|p| p.to_string_lossy().to_lowercase());
    files
}

fn render_manifest(mut entries: Vec<(String, String)>) -> String {
    entries.sort_by(|a, b| a.1.cmp(&b.1));
    entries.into_iter().map(|(digest, rel)| format!("{digest}  {rel}\n")).collect()
}

fn write_manifest(path: &Path, entries: Vec<(String, String)>) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = render_manifest(entries);
    crate::io::util::write_text(path, &text)?;
    Ok(path.to_path_buf())
}

/// Hashes every file in the run directory (except the attestations themselves) into
/// `attestations/bundles.sha256`.
pub fn write_bundle_attestation(runs_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let run_root = runs_dir.join(run_id);
    let mut entries = Vec::new();
    for file_path in iter_files(&run_root) {
        let rel = file_path.strip_prefix(&run_root).unwrap_or(&file_path).to_string_lossy().replace('\\', "/");
        if rel.starts_with("attestations/") {
            continue;
        }
        entries.push((sha256_file(&file_path)?, rel));
    }
    write_manifest(&run_root.join("attestations").join("bundles.sha256"), entries)
}

/// Hashes the shared event ledger file into `attestations/ledger.sha256`.
pub fn write_ledger_attestation(runs_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let run_root = runs_dir.join(run_id);
    let path = ledger_path(runs_dir);
    let entries = if path.exists() {
        let rel = path.strip_prefix(runs_dir).unwrap_or(&path).to_string_lossy().replace('\\', "/");
        vec![(sha256_file(&path)?, rel)]
    } else {
        Vec::new()
    };
    write_manifest(&run_root.join("attestations").join("ledger.sha256"), entries)
}

/// Hashes `FINAL_REPORT.txt` into `attestations/report.sha256`.
pub fn write_report_attestation(runs_dir: &Path, run_id: &str, report_path: &Path) -> Result<PathBuf> {
    let run_root = runs_dir.join(run_id);
    let entries = if report_path.exists() {
        let rel = report_path.strip_prefix(&run_root).unwrap_or(report_path).to_string_lossy().replace('\\', "/");
        vec![(sha256_file(report_path)?, rel)]
    } else {
        Vec::new()
    };
    write_manifest(&run_root.join("attestations").join("report.sha256"), entries)
}

#[derive(Debug, Clone)]
pub struct AttestationPaths {
    pub bundles: PathBuf,
    pub ledger: PathBuf,
    pub report: PathBuf,
}

pub fn write_all_attestations(runs_dir: &Path, run_id: &str, report_path: &Path) -> Result<AttestationPaths> {
    Ok(AttestationPaths {
        bundles: write_bundle_attestation(runs_dir, run_id)?,
        ledger: write_ledger_attestation(runs_dir, run_id)?,
        report: write_report_attestation(runs_dir, run_id, report_path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::util::write_text;
    use tempfile::tempdir;

    #[test]
    fn write_all_attestations_hashes_present_files() {
        let runs_dir = tempdir().unwrap();
        let run_dir = runs_dir.path().join("run-1");
        let report_path = run_dir.join("Z_integrator").join("FINAL_REPORT.txt");
        write_text(&report_path, "hello\n").unwrap();
        write_text(&runs_dir.path().join("factory_ledger.jsonl"), "{}\n").unwrap();

        let paths = write_all_attestations(runs_dir.path(), "run-1", &report_path).unwrap();
        assert!(paths.bundles.exists());
        assert!(paths.ledger.exists());
        assert!(paths.report.exists());
        let report_manifest = std::fs::read_to_string(&paths.report).unwrap();
        assert!(report_manifest.contains("Z_integrator/FINAL_REPORT.txt"));
    }

    #[test]
    fn missing_report_yields_empty_manifest() {
        let runs_dir = tempdir().unwrap();
        let run_dir = runs_dir.path().join("run-1");
        std::fs::create_dir_all(&run_dir).unwrap();
        let report_path = run_dir.join("Z_integrator").join("FINAL_REPORT.txt");
        let path = write_report_attestation(runs_dir.path(), "run-1", &report_path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "");
    }
}
