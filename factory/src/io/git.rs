//! Git adapter for factory commands.
//!
//! The factory drives worktree creation, diffing, and patch checks across several worker
//! repositories, so we keep a small, explicit wrapper around `git` subprocess calls rather than
//! scattering `Command::new("git")` across the codebase.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Ensure the worktree is fully clean (including untracked files).
    pub fn ensure_clean(&self) -> Result<()> {
        self.ensure_clean_except_prefixes(&[])
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Resolve `rev` to a full commit SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", rev])?;
        Ok(out.trim().to_string())
    }

    /// Names of files changed between `base` and `head`, with their change type.
    pub fn diff_name_status(&self, base: &str, head: &str) -> Result<Vec<(String, String)>> {
        let out = self.run_capture(&["diff", "--name-status", &format!("{base}..{head}")])?;
        let mut changes = Vec::new();
        for line in out.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let status = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().trim().to_string();
            if !path.is_empty() {
                changes.push((status, path));
            }
        }
        Ok(changes)
    }

    /// Check, without applying, whether `patch_text` applies cleanly (optionally in reverse).
    pub fn apply_check(&self, patch_text: &str, reverse: bool) -> Result<bool> {
        let mut args = vec!["apply", "--check"];
        if reverse {
            args.push("--reverse");
        }
        args.push("-");
        let mut cmd = Command::new("git");
        cmd.args(&args).current_dir(&self.workdir);
        let output = crate::io::process::run_command_with_timeout(
            cmd,
            Some(patch_text.as_bytes()),
            std::time::Duration::from_secs(30),
            1_000_000,
        )?;
        Ok(output.status.success())
    }

    /// Add a detached worktree at `path`, checked out at `commitish`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_add_detached(&self, path: &Path, commitish: &str) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.run_checked(&["worktree", "add", "--detach", &path_str, commitish])?;
        Ok(())
    }

    /// List registered worktree paths.
    pub fn worktree_list_paths(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        let mut paths = Vec::new();
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                paths.push(PathBuf::from(path.trim()));
            }
        }
        Ok(paths)
    }

    /// Fetch all remotes and prune stale remote-tracking refs. Returns `Ok(false)` instead of
    /// erroring when the repo has no remotes configured.
    pub fn fetch_all_prune(&self) -> Result<bool> {
        let output = self.run(&["fetch", "--all", "--prune"])?;
        Ok(output.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
