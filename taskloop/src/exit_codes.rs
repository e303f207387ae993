//! Stable exit codes for taskloop CLI commands.

/// Command succeeded. For `run`: backlog complete, budget exhausted, iteration
/// cap reached, or the single iteration finished.
pub const OK: i32 = 0;
/// Invalid config, task store or arguments (including validation failures).
pub const INVALID: i32 = 1;
/// `taskloop ready` found no ready task.
pub const NO_READY_TASK: i32 = 2;
/// A harness invocation failed under `on_failure = "stop"`.
pub const INVOCATION_FAILED: i32 = 3;
/// State verification failed under `clean_state = "strict"`.
pub const VERIFICATION_FAILED: i32 = 4;
