//! Meaningful Gate (C10) — pure verdict logic.
//!
//! [`crate::io::meaningful_gate`] collects the inputs (FILES_CHANGED,
//! DIFF.patch, worktree existence checks, `git diff`/`git status`/`git apply
//! --check` results) and calls [`evaluate`] here to turn them into a verdict.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailMode {
    EmptyDeclarations,
    EmptyPatch,
    PhantomPaths,
    NoGitMutation,
    PatchNotApplicable,
    DeclarationMismatch,
}

impl FailMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailMode::EmptyDeclarations => "EMPTY_DECLARATIONS",
            FailMode::EmptyPatch => "EMPTY_PATCH",
            FailMode::PhantomPaths => "PHANTOM_PATHS",
            FailMode::NoGitMutation => "NO_GIT_MUTATION",
            FailMode::PatchNotApplicable => "PATCH_NOT_APPLICABLE",
            FailMode::DeclarationMismatch => "DECLARATION_MISMATCH",
        }
    }
}

/// One declared change, as read from `FILES_CHANGED.json`.
#[derive(Debug, Clone)]
pub struct DeclaredChange {
    pub path: String,
    pub change_type: String,
    pub exists_on_disk: bool,
}

#[derive(Debug, Clone)]
pub struct NoopDeclaration {
    pub reason: String,
    pub ack: String,
}

pub struct GateInputs<'a> {
    pub declared: &'a [DeclaredChange],
    pub noop: Option<&'a NoopDeclaration>,
    pub diff_is_empty: bool,
    pub patch_paths: &'a [String],
    pub git_paths: &'a [String],
    pub patch_applies: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    pub status: Status,
    pub noop: bool,
    pub fail_modes: Vec<FailMode>,
}

/// Evaluate the meaningful-execution gate given pre-collected inputs.
pub fn evaluate(inputs: &GateInputs) -> GateVerdict {
    let noop_declared = inputs
        .noop
        .is_some_and(|n| !n.reason.is_empty() && !n.ack.is_empty());

    let mut fail_modes = BTreeSet::new();

    if !noop_declared && inputs.declared.is_empty() {
        fail_modes.insert(FailMode::EmptyDeclarations);
    }
    if !noop_declared && inputs.diff_is_empty {
        fail_modes.insert(FailMode::EmptyPatch);
    }

    let phantom = inputs.declared.iter().any(|change| {
        let expects_exists = change.change_type != "deleted";
        expects_exists != change.exists_on_disk
    });
    if phantom {
        fail_modes.insert(FailMode::PhantomPaths);
    }

    if !noop_declared && inputs.git_paths.is_empty() {
        fail_modes.insert(FailMode::NoGitMutation);
    }

    let declared_set: BTreeSet<&str> = inputs.declared.iter().map(|c| c.path.as_str()).collect();
    let patch_set: BTreeSet<&str> = inputs.patch_paths.iter().map(String::as_str).collect();
    let git_set: BTreeSet<&str> = inputs.git_paths.iter().map(String::as_str).collect();

    let declared_not_in_git = declared_set.difference(&git_set).count();
    let patch_not_in_git = patch_set.difference(&git_set).count();
    let declared_patch_mismatch = declared_set.symmetric_difference(&patch_set).count();
    if declared_not_in_git > 0 || patch_not_in_git > 0 || declared_patch_mismatch > 0 {
        fail_modes.insert(FailMode::DeclarationMismatch);
    }

    if !noop_declared && !inputs.diff_is_empty && !inputs.patch_applies {
        fail_modes.insert(FailMode::PatchNotApplicable);
    }

    let status = if fail_modes.is_empty() { Status::Pass } else { Status::Fail };

    GateVerdict {
        status,
        noop: noop_declared,
        fail_modes: fail_modes.into_iter().collect(),
    }
}
