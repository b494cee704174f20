//! Stable exit codes for lanekeeper CLI commands.

/// Command succeeded; for `run`, every task reached `done`.
pub const OK: i32 = 0;
/// Invalid config/usage, fatal startup error, or lock held by a live process.
pub const INVALID: i32 = 1;
/// `run` found no ready task and deadlock recovery was exhausted.
pub const STALLED: i32 = 3;
/// `run` reached the configured maximum cycle count.
pub const MAX_CYCLES: i32 = 4;
