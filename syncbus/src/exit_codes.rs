//! Stable exit codes for `syncbus` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (bad layout/config, unreadable inbox, write failure).
pub const FAILED: i32 = 1;
/// Another cycle holds a fresh BUSY state.
pub const BUSY: i32 = 2;
/// Second interrupt; exited without finishing the in-flight cycle.
pub const HARD_STOP: i32 = 130;
