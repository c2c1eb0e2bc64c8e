//! Preflight: a read-only dry run of the checks the Integrator would perform, without creating
//! or mutating any run state. Backs the `preflight` CLI surface.

use std::path::Path;

use anyhow::Result;

use crate::core::status_eval::evaluate_status;
use crate::core::types::{CheckResult, Status};
use crate::io::config::FactoryConfig;
use crate::io::worktree::check_worktree_invariant;

pub const ACTOR: &str = "preflight";

#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub status: Status,
    pub checks: Vec<CheckResult>,
}

/// Runs the worktree invariant check and a config validation pass, read-only. Worker worktrees
/// are not created here; a missing worktrees directory is not itself a failure (see
/// [`check_worktree_invariant`]) but an unknown path under it is.
pub fn run_preflight(worktrees_dir: &Path, workers: &[&str], config: &FactoryConfig) -> Result<PreflightReport> {
    let mut checks = Vec::new();

    let config_check = match config.validate() {
        Ok(()) => CheckResult::new("config_validation", Status::Pass, ACTOR),
        Err(err) => CheckResult::new("config_validation", Status::Pass, ACTOR)
            .with_rc(2)
            .with_detail(err.to_string()),
    };
    checks.push(config_check);

    let invariant = check_worktree_invariant(worktrees_dir, workers)?;
    let detail = if invariant.unknown_paths.is_empty() {
        format!("{} known worktree slot(s), {} present", invariant.max_allowed, invariant.count)
    } else {
        format!("unexpected paths under worktrees root: {:?}", invariant.unknown_paths)
    };
    let worktree_check = CheckResult::new("worktree_invariant", Status::Pass, ACTOR)
        .with_rc(if invariant.status == Status::Pass { 0 } else { 2 })
        .with_detail(detail);
    checks.push(worktree_check);

    let status = evaluate_status(&checks, &[], &[], &[]);
    Ok(PreflightReport { status, checks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn preflight_passes_on_clean_state() {
        let worktrees_dir = tempdir().unwrap();
        let config = FactoryConfig::default();
        let report = run_preflight(worktrees_dir.path(), &["A_worker"], &config).unwrap();
        assert_eq!(report.status, Status::Pass);
    }

    #[test]
    fn preflight_blocks_on_unknown_worktree_path() {
        let worktrees_dir = tempdir().unwrap();
        std::fs::create_dir_all(worktrees_dir.path().join("mystery")).unwrap();
        let config = FactoryConfig::default();
        let report = run_preflight(worktrees_dir.path(), &["A_worker"], &config).unwrap();
        assert_eq!(report.status, Status::Blocked);
    }
}
