//! Run state storage for `taskloop status`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ledger::UsageSummary;

/// Persisted bookkeeping for the latest run (`.taskloop/state/run_state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: Option<String>,
    pub harness: Option<String>,
    /// Iterations completed so far.
    pub iterations: u32,
    pub last_task: Option<String>,
    pub last_exit_code: Option<i32>,
    /// Set once the run has stopped.
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: UsageSummary,
}

/// Load run state; `None` when no run has been recorded yet.
pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    Ok(Some(state))
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = ?state.run_id, iterations = state.iterations, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
