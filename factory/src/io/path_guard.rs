//! Filesystem-touching half of the path guard: resolves a path against a root and confirms the
//! resolved path, including through any existing symlinks, stays inside that root.
//!
//! The in-memory half ([`crate::core::path_guard::resolve_within_root`]) already rejects `..`
//! segments lexically; this module additionally canonicalizes the longest existing ancestor to
//! catch a symlink planted inside the root that points back out of it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::path_guard::{PathGuardReason, resolve_within_root};

/// Resolves `relative` under `root`, then walks up from the resolved path to the first existing
/// ancestor, canonicalizes it, and confirms that canonical form still falls under `root`'s own
/// canonical form. Returns the (non-canonicalized) resolved path on success, so callers can still
/// create a not-yet-existing file at that location.
pub fn ensure_within_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let resolved = resolve_within_root(root, relative)
        .with_context(|| format!("path guard rejected {relative}"))?;

    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("canonicalize root {}", root.display()))?;

    let mut existing_ancestor: &Path = &resolved;
    while !existing_ancestor.exists() {
        match existing_ancestor.parent() {
            Some(parent) => existing_ancestor = parent,
            None => break,
        }
    }
    if existing_ancestor.as_os_str().is_empty() {
        return Ok(resolved);
    }
    let canonical_ancestor = existing_ancestor
        .canonicalize()
        .with_context(|| format!("canonicalize {}", existing_ancestor.display()))?;
    if !canonical_ancestor.starts_with(&canonical_root) {
        anyhow::bail!(
            "path rejected ({}): {} escapes root {} via symlink",
            PathGuardReason::SymlinkEscape.as_str(),
            relative,
            root.display()
        );
    }
    Ok(resolved)
}
