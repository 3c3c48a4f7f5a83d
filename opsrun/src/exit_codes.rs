//! Stable exit codes for pipeline results and the `opsrun` CLI.

/// Command or pipeline succeeded.
pub const OK: i32 = 0;
/// A step failed, a process could not be started, or the CLI hit an error.
pub const FAILED: i32 = 1;
/// The run was cancelled cooperatively (128 + SIGINT, as shells report it).
pub const CANCELLED: i32 = 130;
/// Sentinel for a step whose process timed out, died by signal, or could not be reaped.
pub const WAIT_FAILED: i32 = -1;
