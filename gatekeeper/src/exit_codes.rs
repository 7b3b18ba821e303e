//! Stable exit codes for gatekeeper CLI commands.

/// Screen was clear, or every operation completed.
pub const OK: i32 = 0;
/// Invalid input, config or any other error.
pub const INVALID: i32 = 1;
/// Blocked by a critical layer, or the submission ended failed.
pub const BLOCKED: i32 = 2;
/// At least one operation awaits confirmation or is held.
pub const PENDING: i32 = 3;
