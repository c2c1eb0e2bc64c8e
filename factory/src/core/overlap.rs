//! Overlap & Scope Detector (C9): cross-worker file-collision and
//! policy-violation analysis.
//!
//! Pure in-memory logic. Callers in [`crate::io::contracts`] and
//! [`crate::io::integrator`] load `FILES_CHANGED.json`/`DIFF.patch`/
//! `SCOPE_LOCK.json` from disk and pass the parsed data in here.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::path_guard::{canonical_path_key, is_protected_path};
use crate::core::types::Status;

/// One worker's declared file-collision inputs.
#[derive(Debug, Clone)]
pub struct WorkerOverlapInput {
    pub worker: String,
    pub declared_paths: Vec<String>,
    pub patch_paths: Vec<String>,
    pub patch_sha256: String,
    pub allow_shared_paths: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Overlap {
    pub path: String,
    pub workers: Vec<String>,
    pub status: Status,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HiddenOverlap {
    pub worker: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidPath {
    pub worker: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OverlapReport {
    pub status: Status,
    pub overlaps: Vec<Overlap>,
    pub hidden_overlaps: Vec<HiddenOverlap>,
    pub invalid_paths: Vec<InvalidPath>,
    pub blocked: usize,
}

/// Detect file overlaps across worker bundles.
///
/// `strict` mirrors `run.strict_collision_mode`; `allow_identical_patch_overlap`
/// mirrors the config flag of the same name.
pub fn detect_file_overlaps(
    inputs: &[WorkerOverlapInput],
    strict: bool,
    allow_identical_patch_overlap: bool,
) -> OverlapReport {
    let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut invalid_paths = Vec::new();
    let mut hidden_overlaps = Vec::new();

    for input in inputs {
        let mut declared_keys: BTreeSet<String> = BTreeSet::new();
        for raw in &input.declared_paths {
            match canonical_path_key(raw) {
                Ok(key) => {
                    declared_keys.insert(key.clone());
                    owners.entry(key).or_default().insert(input.worker.clone());
                }
                Err(err) => invalid_paths.push(InvalidPath {
                    worker: input.worker.clone(),
                    path: raw.clone(),
                    reason: err.reason.as_str().to_string(),
                }),
            }
        }

        for raw in &input.patch_paths {
            let Ok(key) = canonical_path_key(raw) else {
                continue;
            };
            owners.entry(key.clone()).or_default().insert(input.worker.clone());
            if !declared_keys.contains(&key) {
                hidden_overlaps.push(HiddenOverlap {
                    worker: input.worker.clone(),
                    path: key,
                });
            }
        }
    }

    let identical_patches = !inputs.is_empty()
        && inputs
            .iter()
            .all(|i| i.patch_sha256 == inputs[0].patch_sha256);

    let mut overlaps = Vec::new();
    for (path, touchers) in &owners {
        if touchers.len() < 2 {
            continue;
        }
        let mut workers: Vec<String> = touchers.iter().cloned().collect();
        workers.sort();

        let all_allow_shared = workers
            .iter()
            .all(|w| inputs.iter().find(|i| &i.worker == w).is_some_and(|i| i.allow_shared_paths.contains(path)));

        let (status, reason) = if strict && !all_allow_shared {
            if identical_patches && allow_identical_patch_overlap {
                (Status::Warn, "identical_patch_exception".to_string())
            } else {
                (Status::Blocked, "strict_collision".to_string())
            }
        } else if all_allow_shared {
            (Status::Warn, "allow_shared_paths".to_string())
        } else if identical_patches && allow_identical_patch_overlap {
            (Status::Warn, "identical_patch_exception".to_string())
        } else {
            (Status::Blocked, "collision".to_string())
        };

        overlaps.push(Overlap {
            path: path.clone(),
            workers,
            status,
            reason,
        });
    }

    overlaps.sort_by(|a, b| (a.path.clone(), a.workers.join(",")).cmp(&(b.path.clone(), b.workers.join(","))));
    hidden_overlaps.sort_by(|a, b| (a.worker.clone(), a.path.clone()).cmp(&(b.worker.clone(), b.path.clone())));
    invalid_paths.sort_by(|a, b| (a.worker.clone(), a.path.clone()).cmp(&(b.worker.clone(), b.path.clone())));

    let blocked = overlaps.iter().filter(|o| o.status == Status::Blocked).count()
        + hidden_overlaps.len()
        + invalid_paths.len();

    OverlapReport {
        status: if blocked == 0 { Status::Pass } else { Status::Blocked },
        overlaps,
        hidden_overlaps,
        invalid_paths,
        blocked,
    }
}

/// A worker's declared capability, mirroring `SCOPE_LOCK.json`.
#[derive(Debug, Clone, Default)]
pub struct ScopeLock {
    pub allowed_globs: Vec<String>,
    pub blocked_globs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeViolation {
    pub worker: String,
    pub path: String,
    pub rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScopeReport {
    pub status: Status,
    pub violations: Vec<ScopeViolation>,
    pub blocked: usize,
}

/// Detect scope violations for one worker's declared paths against its lock.
pub fn detect_scope_violations(worker: &str, declared_paths: &[String], lock: &ScopeLock) -> Vec<ScopeViolation> {
    let mut violations = Vec::new();
    for raw in declared_paths {
        let Ok(key) = canonical_path_key(raw) else {
            continue;
        };
        if is_protected_path(&key) {
            violations.push(ScopeViolation {
                worker: worker.to_string(),
                path: key.clone(),
                rule: "protected_path".to_string(),
            });
            continue;
        }
        if !lock.allowed_globs.is_empty() && !lock.allowed_globs.iter().any(|g| glob_match(g, &key)) {
            violations.push(ScopeViolation {
                worker: worker.to_string(),
                path: key.clone(),
                rule: "outside_allowlist".to_string(),
            });
            continue;
        }
        if lock.blocked_globs.iter().any(|g| glob_match(g, &key)) {
            violations.push(ScopeViolation {
                worker: worker.to_string(),
                path: key.clone(),
                rule: "denylist".to_string(),
            });
        }
    }
    violations
}

/// Detect scope violations across all workers and fold into a report.
pub fn detect_scope_violations_all(inputs: &[(String, Vec<String>, ScopeLock)]) -> ScopeReport {
    let mut violations: Vec<ScopeViolation> = inputs
        .iter()
        .flat_map(|(worker, paths, lock)| detect_scope_violations(worker, paths, lock))
        .collect();
    violations.sort_by(|a, b| (a.worker.clone(), a.path.clone()).cmp(&(b.worker.clone(), b.path.clone())));
    let blocked = violations.len();
    ScopeReport {
        status: if blocked == 0 { Status::Pass } else { Status::Blocked },
        violations,
        blocked,
    }
}

/// Minimal glob matcher supporting `*` (any run within a segment) and `**`
/// (any number of segments), sufficient for the allow/deny glob policies
/// this system uses. Matching is performed on `/`-joined canonical paths.
fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=path.len()).any(|i| match_segments(rest, &path[i..]))
        }
        Some((&head, rest)) => match path.split_first() {
            Some((&first, path_rest)) => segment_match(head, first) && match_segments(rest, path_rest),
            None => false,
        },
    }
}

fn segment_match(pattern: &str, segment: &str) -> bool {
    fnmatch_like(pattern.as_bytes(), segment.as_bytes())
}

fn fnmatch_like(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            fnmatch_like(&pattern[1..], text) || (!text.is_empty() && fnmatch_like(pattern, &text[1..]))
        }
        (Some(&p), Some(&t)) if p == t => fnmatch_like(&pattern[1..], &text[1..]),
        _ => false,
    }
}
