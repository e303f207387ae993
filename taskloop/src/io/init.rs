//! Initialization helpers for `.taskloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{LoopConfig, write_config};
use super::task_store::write_task_store;
use crate::core::graph::TaskGraph;

/// Canonical paths within `.taskloop/` for a project root.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub loop_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub logs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub run_state_path: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let loop_dir = root.join(".taskloop");
        let state_dir = loop_dir.join("state");
        Self {
            root: root.clone(),
            config_path: loop_dir.join("config.toml"),
            gitignore_path: loop_dir.join(".gitignore"),
            logs_dir: loop_dir.join("logs"),
            run_state_path: state_dir.join("run_state.json"),
            state_dir,
            loop_dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing loop-owned files.
    pub force: bool,
}

/// Create `.taskloop/` scaffolding in `root`: default config, an empty task
/// store and a `.gitignore` for run artifacts.
///
/// Fails if `.taskloop/` already exists unless `options.force` is set.
pub fn init_taskloop(root: &Path, options: &InitOptions) -> Result<LoopPaths> {
    let paths = LoopPaths::new(root);
    if paths.loop_dir.exists() && !paths.loop_dir.is_dir() {
        return Err(anyhow!("taskloop init: .taskloop exists but is not a directory"));
    }
    if paths.loop_dir.exists() && !options.force {
        return Err(anyhow!(
            "taskloop init: .taskloop already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.loop_dir)?;
    create_dir(&paths.logs_dir)?;
    create_dir(&paths.state_dir)?;

    let config = LoopConfig::default();
    write_config(&paths.config_path, &config)?;
    write_task_store(&config.task_store_path(root), &TaskGraph::default())?;
    fs::write(&paths.gitignore_path, LOOP_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const LOOP_GITIGNORE: &str = "logs/\nstate/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::task_store::load_task_store;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        let paths = init_taskloop(root, &InitOptions { force: false }).expect("init");

        assert!(paths.loop_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.state_dir.is_dir());
        let config = load_config(&paths.config_path).expect("config");
        assert_eq!(config, LoopConfig::default());
        let graph = load_task_store(&config.task_store_path(root)).expect("store");
        assert!(graph.tasks().is_empty());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            LOOP_GITIGNORE
        );
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_taskloop(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_taskloop(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_taskloop(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "harness = \"aider\"\n").expect("write custom");

        init_taskloop(temp.path(), &InitOptions { force: true }).expect("re-init");
        let config = load_config(&paths.config_path).expect("config");
        assert_eq!(config.harness, "auto");
    }
}
