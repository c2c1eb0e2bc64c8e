//! Shared value types for check results, run status, and ledger event kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed worker roster. The roster is immutable once a run is created.
pub const WORKERS: [&str; 4] = ["A_worker", "B_worker", "C_worker", "D_worker"];
pub const INTEGRATOR: &str = "Z_integrator";
pub const DEFAULT_BRANCH_PREFIX: &str = "codex/factory";

/// Terminal or intermediate status of a single check or of a whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Blocked,
    Fail,
    Warn,
    Pending,
}

impl Status {
    /// The exit code this status maps to, per the Status Evaluator contract.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Pass | Status::Warn => 0,
            Status::Fail => 1,
            Status::Blocked => 2,
            Status::Pending => 3,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Pass
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Pass => "PASS",
            Status::Blocked => "BLOCKED",
            Status::Fail => "FAIL",
            Status::Warn => "WARN",
            Status::Pending => "PENDING",
        };
        f.write_str(label)
    }
}

/// A single named check outcome, as produced by any component and folded by
/// the Status Evaluator.
///
/// If `rc != 0` and `status == Pass`, callers must apply [`CheckResult::normalize`]
/// before using the result: the return code is authoritative over a claimed PASS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: Status,
    pub rc: i32,
    pub required: bool,
    pub detail: String,
    pub actor: String,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, status: Status, actor: impl Into<String>) -> Self {
        let mut check = CheckResult {
            name: name.into(),
            status,
            rc: 0,
            required: true,
            detail: String::new(),
            actor: actor.into(),
        };
        check.normalize();
        check
    }

    pub fn with_rc(mut self, rc: i32) -> Self {
        self.rc = rc;
        self.normalize();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// rc-authoritative collapse: a nonzero rc on a claimed PASS becomes BLOCKED.
    pub fn normalize(&mut self) {
        if self.rc != 0 && self.status == Status::Pass {
            self.status = Status::Blocked;
        }
    }
}

/// Ledger event types. Anything outside this set is rejected by the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStart,
    RunInit,
    Preflight,
    WorktreeCreate,
    LaunchResult,
    WorkerBundleDiscovered,
    BundleValidated,
    OverlapCheck,
    ScopeCheck,
    IntegrateStart,
    ReportWritten,
    IntegrationResult,
    RunEnd,
    RunState,
    OneshotSummary,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStart => "RUN_START",
            EventType::RunInit => "RUN_INIT",
            EventType::Preflight => "PREFLIGHT",
            EventType::WorktreeCreate => "WORKTREE_CREATE",
            EventType::LaunchResult => "LAUNCH_RESULT",
            EventType::WorkerBundleDiscovered => "WORKER_BUNDLE_DISCOVERED",
            EventType::BundleValidated => "BUNDLE_VALIDATED",
            EventType::OverlapCheck => "OVERLAP_CHECK",
            EventType::ScopeCheck => "SCOPE_CHECK",
            EventType::IntegrateStart => "INTEGRATE_START",
            EventType::ReportWritten => "REPORT_WRITTEN",
            EventType::IntegrationResult => "INTEGRATION_RESULT",
            EventType::RunEnd => "RUN_END",
            EventType::RunState => "RUN_STATE",
            EventType::OneshotSummary => "ONESHOT_SUMMARY",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
