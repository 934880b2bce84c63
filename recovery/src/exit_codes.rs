//! Stable exit codes for the `recovery` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Bad input, invalid config or checkpoint, or any other error.
pub const INVALID: i32 = 1;
/// Preflight says the battle cannot start, or the preflight token was rejected.
pub const BLOCKED: i32 = 2;
