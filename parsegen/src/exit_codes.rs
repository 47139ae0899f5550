//! Stable exit codes for parsegen CLI commands.

/// Command succeeded; for `run`, every target produced a passing parser.
pub const OK: i32 = 0;
/// Invalid config, unknown target, failed `check`, or another fatal error.
pub const INVALID: i32 = 1;
/// A run used every attempt without a passing candidate.
pub const EXHAUSTED: i32 = 3;
/// A run was cancelled before it finished.
pub const CANCELLED: i32 = 4;
