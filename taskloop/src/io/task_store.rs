//! Task store load/save with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::graph::TaskGraph;
use crate::core::types::{Task, TaskStatus};
use crate::error::ValidationError;

/// Draft 2020-12 schema for the task store file.
pub const TASK_STORE_SCHEMA: &str = include_str!("../../schemas/task_store.schema.json");

static SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let value: Value = serde_json::from_str(TASK_STORE_SCHEMA).map_err(|e| e.to_string())?;
    validator_for(&value).map_err(|e| e.to_string())
});

#[derive(Debug, Serialize, Deserialize)]
struct TaskStoreFile {
    tasks: Vec<Task>,
}

/// Parse and validate store contents. `origin` is used in error context.
pub fn parse_task_store(contents: &str, origin: &str) -> Result<TaskGraph> {
    let value: Value =
        serde_json::from_str(contents).with_context(|| format!("parse task store {origin}"))?;
    validate_schema(&value)?;
    let file: TaskStoreFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize task store {origin}"))?;
    let graph = TaskGraph::new(file.tasks);
    graph.validate()?;
    Ok(graph)
}

/// Load and validate the store from disk (schema + invariants).
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_task_store(path: &Path) -> Result<TaskGraph> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read task store {}", path.display()))?;
    let graph = parse_task_store(&contents, &path.display().to_string())?;
    debug!(tasks = graph.tasks().len(), "task store loaded");
    Ok(graph)
}

/// Atomically write the store (pretty JSON, trailing newline).
pub fn write_task_store(path: &Path, graph: &TaskGraph) -> Result<()> {
    let file = TaskStoreFile {
        tasks: graph.tasks().to_vec(),
    };
    let mut buf = serde_json::to_string_pretty(&file).context("serialize task store")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Reload the store, apply one status transition, write it back.
///
/// Returns the previous status. Reloading first keeps edits the harness made
/// to other tasks.
#[instrument(skip_all, fields(task_id = id, status = %status))]
pub fn update_task_status(path: &Path, id: &str, status: TaskStatus) -> Result<TaskStatus> {
    let mut graph = load_task_store(path)?;
    let previous = graph.set_status(id, status)?;
    if previous != status {
        write_task_store(path, &graph)?;
    }
    Ok(previous)
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = SCHEMA
        .as_ref()
        .map_err(|err| anyhow!("invalid embedded task store schema: {err}"))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let issues = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    Err(ValidationError { issues }.into())
}
