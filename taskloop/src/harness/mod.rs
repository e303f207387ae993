//! Harness adapters: one per agent CLI, behind a uniform invocation contract.
//!
//! The [`HarnessAdapter`] trait decouples loop orchestration from the concrete
//! agent backend. Each adapter owns its command line and wire format; callers
//! only see [`InvokeOutcome`]. Tests use scripted adapters that return
//! predetermined outcomes without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::types::UsageRecord;
use crate::io::process::{TeeOptions, capture_lines, run_command_consuming};

pub mod claude;
pub mod minimal;
pub mod opencode;
pub mod registry;
pub mod stream;

use stream::{StreamState, events};

/// Separator placed between system and task prompt for single-channel harnesses.
pub const PROMPT_SEPARATOR: &str = "\n\n---\n\n";

/// Parameters for one harness invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Working directory for the harness process.
    pub workdir: PathBuf,
    pub system_prompt: String,
    pub task_prompt: String,
    /// Mirror raw harness output to stderr.
    pub debug: bool,
    /// Print display text to stdout as it arrives.
    pub echo: bool,
    /// Kill the harness after this long.
    pub timeout: Duration,
    /// Bound on captured plain stdout and stderr.
    pub output_limit_bytes: usize,
    /// Copy raw stdout here when set.
    pub stream_path: Option<PathBuf>,
}

impl InvokeRequest {
    fn tee(&self) -> TeeOptions<'_> {
        TeeOptions {
            stream_path: self.stream_path.as_deref(),
            mirror_stderr: self.debug,
        }
    }
}

/// Normalized result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    /// Child exit code, verbatim; 124 when killed on timeout.
    pub exit_code: i32,
    pub display_text: String,
    /// Zeroed for plain invocations.
    pub usage: UsageRecord,
    pub timed_out: bool,
    /// Bounded stderr, for diagnostics.
    pub stderr: String,
}

impl InvokeOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Abstraction over agent CLIs.
pub trait HarnessAdapter {
    /// Harness id as used in config and the capability table.
    fn id(&self) -> &str;

    /// Executable this adapter spawns.
    fn binary(&self) -> &str;

    /// Run to completion and capture plain output. Usage is zeroed.
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome>;

    /// Run with the harness event stream enabled and accumulate usage.
    ///
    /// Harnesses without a stream protocol fall back to [`Self::invoke`].
    fn invoke_streaming(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        self.invoke(request)
    }
}

// Compile-time assertion: HarnessAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn HarnessAdapter) {}
};

/// Prompt for harnesses that take a single prompt: system, separator, task.
pub fn combined_prompt(system_prompt: &str, task_prompt: &str) -> String {
    if system_prompt.trim().is_empty() {
        return task_prompt.to_string();
    }
    format!("{system_prompt}{PROMPT_SEPARATOR}{task_prompt}")
}

/// Spawn `cmd` and capture its stdout as display text.
pub(crate) fn run_plain(
    cmd: Command,
    stdin: Option<&[u8]>,
    request: &InvokeRequest,
) -> Result<InvokeOutcome> {
    let limit = request.output_limit_bytes;
    let echo = request.echo;
    let output = run_command_consuming(
        cmd,
        stdin,
        request.timeout,
        limit,
        request.tee(),
        move |reader| capture_lines(reader, limit, echo),
    )?;
    let exit_code = output.exit_code();
    let stderr = output.stderr_lossy();
    let (stdout, truncated) = output.stdout.context("read harness stdout")?;
    if truncated > 0 {
        warn!(truncated, "harness stdout truncated");
    }
    debug!(exit_code, timed_out = output.timed_out, "plain invocation finished");
    Ok(InvokeOutcome {
        exit_code,
        display_text: String::from_utf8_lossy(&stdout).into_owned(),
        usage: UsageRecord::default(),
        timed_out: output.timed_out,
        stderr,
    })
}

/// Spawn `cmd` and fold its NDJSON event stream with `apply`.
///
/// The fold runs on the stdout reader thread; its state comes back on join.
/// `output_limit_bytes` bounds both the kept display text and any single line.
pub(crate) fn run_streaming<E, F>(
    cmd: Command,
    stdin: Option<&[u8]>,
    request: &InvokeRequest,
    apply: F,
) -> Result<InvokeOutcome>
where
    E: DeserializeOwned + 'static,
    F: Fn(&mut StreamState, E) + Send + 'static,
{
    let echo = request.echo;
    let limit = request.output_limit_bytes;
    let output = run_command_consuming(
        cmd,
        stdin,
        request.timeout,
        limit,
        request.tee(),
        move |reader| {
            let state = StreamState::new(echo).with_limit(limit);
            events::<E, _>(reader)
                .max_line_bytes(limit)
                .fold(state, |mut state, event| {
                    apply(&mut state, event);
                    state
                })
        },
    )?;
    let exit_code = output.exit_code();
    let stderr = output.stderr_lossy();
    let (display_text, usage) = output.stdout.finish();
    debug!(
        exit_code,
        timed_out = output.timed_out,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        estimated = usage.estimated,
        "streaming invocation finished"
    );
    Ok(InvokeOutcome {
        exit_code,
        display_text,
        usage,
        timed_out: output.timed_out,
        stderr,
    })
}
