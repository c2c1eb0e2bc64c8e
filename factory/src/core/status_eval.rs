//! Status Evaluator (C13): the sole authority for folding typed check
//! results into a terminal run status and exit code.

use crate::core::types::{CheckResult, Status};

/// Evaluate a set of check results plus loose error/blocker strings into one
/// terminal [`Status`].
///
/// - Any internal error present -> FAIL.
/// - Else any required check not PASS, or any schema error, or any blocker -> BLOCKED.
/// - Else -> PASS.
pub fn evaluate_status(
    required_checks: &[CheckResult],
    schema_errors: &[String],
    blockers: &[String],
    internal_errors: &[String],
) -> Status {
    if !internal_errors.is_empty() {
        return Status::Fail;
    }

    let any_required_not_pass = required_checks
        .iter()
        .any(|check| check.required && check.status != Status::Pass);

    if any_required_not_pass || !schema_errors.is_empty() || !blockers.is_empty() {
        return Status::Blocked;
    }

    Status::Pass
}

/// Combine several already-evaluated statuses into the most severe one,
/// using the ordering FAIL > BLOCKED > PENDING > WARN > PASS.
pub fn combine_statuses(statuses: &[Status]) -> Status {
    fn severity(status: Status) -> u8 {
        match status {
            Status::Fail => 4,
            Status::Blocked => 3,
            Status::Pending => 2,
            Status::Warn => 1,
            Status::Pass => 0,
        }
    }
    statuses
        .iter()
        .copied()
        .max_by_key(|s| severity(*s))
        .unwrap_or(Status::Pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::INTEGRATOR;

    #[test]
    fn all_pass_is_pass() {
        let checks = vec![CheckResult::new("a", Status::Pass, INTEGRATOR)];
        assert_eq!(evaluate_status(&checks, &[], &[], &[]), Status::Pass);
    }

    #[test]
    fn required_failure_is_blocked() {
        let checks = vec![CheckResult::new("a", Status::Fail, INTEGRATOR)];
        assert_eq!(evaluate_status(&checks, &[], &[], &[]), Status::Blocked);
    }

    #[test]
    fn optional_failure_does_not_block() {
        let checks = vec![CheckResult::new("a", Status::Fail, INTEGRATOR).optional()];
        assert_eq!(evaluate_status(&checks, &[], &[], &[]), Status::Pass);
    }

    #[test]
    fn internal_error_wins_over_everything() {
        let checks = vec![CheckResult::new("a", Status::Pass, INTEGRATOR)];
        let blockers = vec!["overlap: x".to_string()];
        let internal = vec!["panic in integrator".to_string()];
        assert_eq!(evaluate_status(&checks, &[], &blockers, &internal), Status::Fail);
    }

    #[test]
    fn schema_error_blocks_even_with_passing_checks() {
        let checks = vec![CheckResult::new("a", Status::Pass, INTEGRATOR)];
        let schema_errors = vec!["/files_changed/0/path: missing".to_string()];
        assert_eq!(evaluate_status(&checks, &schema_errors, &[], &[]), Status::Blocked);
    }

    #[test]
    fn combine_picks_most_severe() {
        assert_eq!(
            combine_statuses(&[Status::Pass, Status::Warn, Status::Blocked]),
            Status::Blocked
        );
        assert_eq!(combine_statuses(&[]), Status::Pass);
    }
}
