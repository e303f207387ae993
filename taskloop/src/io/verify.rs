//! Post-invocation state verification.
//!
//! After a harness reports success the loop asks a [`StateVerifier`] whether
//! the repository is in an acceptable state before the task may close. The
//! default verifier checks that the working tree is clean (our own bookkeeping
//! excepted) and then runs an optional verification command.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::io::config::LoopConfig;
use crate::io::git::{Git, describe_dirty};
use crate::io::process::{TeeOptions, capture_lines, run_command_consuming};

/// Outcome of a verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { reason: String },
}

impl Verdict {
    pub fn fail(reason: impl Into<String>) -> Self {
        Verdict::Fail {
            reason: reason.into(),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub task_id: String,
    /// Where the verification command's output is written.
    pub log_path: PathBuf,
}

pub trait StateVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<Verdict>;
}

/// Clean-tree check plus optional command.
#[derive(Debug, Clone)]
pub struct WorkspaceVerifier {
    /// Path prefixes (relative to the workdir) the loop itself writes.
    pub allowed_prefixes: Vec<String>,
    /// Argv of the verification command; empty skips it.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl WorkspaceVerifier {
    /// Verifier for `config`: `.taskloop/` and the task store are ours.
    pub fn from_config(config: &LoopConfig) -> Self {
        let mut allowed_prefixes = vec![".taskloop/".to_string()];
        let store = config.task_store.to_string_lossy().into_owned();
        if !store.starts_with(".taskloop/") {
            allowed_prefixes.push(store);
        }
        Self {
            allowed_prefixes,
            command: config.verify.command.clone(),
            timeout: Duration::from_secs(config.verify.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl StateVerifier for WorkspaceVerifier {
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    fn verify(&self, request: &VerifyRequest) -> Result<Verdict> {
        let git = Git::new(&request.workdir);
        let allowed: Vec<&str> = self.allowed_prefixes.iter().map(String::as_str).collect();
        let dirty = match git.dirty_entries_except(&allowed) {
            Ok(dirty) => dirty,
            Err(err) => return Ok(Verdict::fail(format!("{err:#}"))),
        };
        if !dirty.is_empty() {
            warn!(count = dirty.len(), "uncommitted changes after invocation");
            return Ok(Verdict::fail(describe_dirty(&dirty)));
        }

        let Some((program, args)) = self.command.split_first() else {
            debug!("no verification command configured");
            return Ok(Verdict::Pass);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let limit = self.output_limit_bytes;
        let output = run_command_consuming(
            cmd,
            None,
            self.timeout,
            limit,
            TeeOptions::default(),
            move |reader| capture_lines(reader, limit, false),
        )
        .with_context(|| format!("run verification command {}", self.command.join(" ")))?;

        let exit_code = output.exit_code();
        let stderr = output.stderr_lossy();
        let (stdout, _) = output.stdout.context("read verification stdout")?;
        write_verify_log(&request.log_path, &stdout, stderr.as_bytes())?;

        if output.timed_out {
            return Ok(Verdict::fail(format!(
                "`{}` timed out after {}s",
                self.command.join(" "),
                self.timeout.as_secs()
            )));
        }
        if exit_code != 0 {
            return Ok(Verdict::fail(format!(
                "`{}` exited with code {exit_code} (see {})",
                self.command.join(" "),
                request.log_path.display()
            )));
        }
        Ok(Verdict::Pass)
    }
}

fn write_verify_log(path: &Path, stdout: &[u8], stderr: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(stderr));
    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}
