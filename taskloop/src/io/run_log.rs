//! Append-only JSONL run log under `.taskloop/logs/`.
//!
//! One line per loop event, each stamped with an RFC 3339 timestamp and the
//! run id. Raw harness streams and verification output for the run live in a
//! sibling directory named after the run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Fresh run identifier, e.g. `run-20260301_142233-4242`.
pub fn new_run_id() -> String {
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}

#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    path: PathBuf,
    artifacts_dir: PathBuf,
}

#[derive(Serialize)]
struct Line<'a, E> {
    ts: String,
    run_id: &'a str,
    #[serde(flatten)]
    event: &'a E,
}

impl RunLog {
    pub fn new(logs_dir: &Path, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            path: logs_dir.join(format!("{run_id}.jsonl")),
            artifacts_dir: logs_dir.join(run_id),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw stdout of one harness invocation.
    pub fn stream_path(&self, iteration: u32, task_id: &str) -> PathBuf {
        self.artifacts_dir
            .join(format!("{iteration:03}-{}.ndjson", sanitize(task_id)))
    }

    /// Output of the verification command for one iteration.
    pub fn verify_log_path(&self, iteration: u32, task_id: &str) -> PathBuf {
        self.artifacts_dir
            .join(format!("{iteration:03}-{}.verify.log", sanitize(task_id)))
    }

    /// Append one event. `event` must serialize to a JSON object.
    pub fn append<E: Serialize>(&self, event: &E) -> Result<()> {
        let line = Line {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id: &self.run_id,
            event,
        };
        let mut buf = serde_json::to_string(&line).context("serialize run log event")?;
        buf.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open run log {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append run log {}", self.path.display()))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
