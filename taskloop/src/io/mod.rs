//! I/O helpers: config, task store, subprocesses, git and run artifacts.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod config;
pub mod git;
pub mod init;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod run_state;
pub mod task_store;
pub mod verify;

/// Write `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
