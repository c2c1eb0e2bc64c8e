//! Stable process exit codes for factory CLI commands.
//!
//! Mirrors [`crate::core::types::Status::exit_code`] so a shell script driving
//! the CLI can branch on `$?` without parsing output.

/// Command succeeded; run or check is PASS (or WARN, which does not block).
pub const OK: i32 = 0;
/// Run or check is FAIL.
pub const FAIL: i32 = 1;
/// Run or check is BLOCKED: a required artifact, lock, or invariant failed.
pub const BLOCKED: i32 = 2;
/// Run or check is PENDING: work has not completed yet.
pub const PENDING: i32 = 3;
/// The command itself could not execute (bad arguments, unreadable config, I/O error).
pub const USAGE_ERROR: i32 = 64;
