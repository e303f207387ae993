//! Loop configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::graph::ReadyFilter;
use crate::core::ledger::DEFAULT_WARN_THRESHOLD_PERCENT;
use crate::harness::registry::AUTO;

/// What to do when a harness exits non-zero or times out.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Reopen the task and abort the run.
    #[default]
    Stop,
    /// Reopen the task, skip it for the rest of the run, keep going.
    MoveOn,
}

/// What to do when post-invocation verification fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanStatePolicy {
    #[default]
    Strict,
    Warn,
}

/// Loop configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Harness id, or `auto` for the first one installed.
    pub harness: String,

    /// Task store path, relative to the repository root.
    pub task_store: PathBuf,

    /// Token ceiling per run. Absent means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,

    pub warn_threshold_percent: u8,

    /// Kill a harness invocation after this many seconds.
    pub invocation_timeout_secs: u64,

    /// Bound on captured harness output.
    pub output_limit_bytes: usize,

    pub max_iterations: u32,

    pub on_failure: FailurePolicy,

    pub clean_state: CleanStatePolicy,

    /// Only schedule children of this epic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epic: Option<String>,

    /// Only schedule tasks carrying this label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Replaces the built-in system prompt when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_path: Option<PathBuf>,

    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command run after each successful invocation (e.g. `["just","ci"]`).
    /// Empty means only the working-tree check runs.
    pub command: Vec<String>,

    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30 * 60,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            harness: AUTO.to_string(),
            task_store: PathBuf::from(".taskloop/tasks.json"),
            budget_tokens: None,
            warn_threshold_percent: DEFAULT_WARN_THRESHOLD_PERCENT,
            invocation_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            max_iterations: 100,
            on_failure: FailurePolicy::Stop,
            clean_state: CleanStatePolicy::Strict,
            epic: None,
            label: None,
            system_prompt_path: None,
            verify: VerifyConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.harness.trim().is_empty() {
            return Err(anyhow!("harness must be a harness id or \"auto\""));
        }
        if self.task_store.as_os_str().is_empty() {
            return Err(anyhow!("task_store must be a path"));
        }
        if !(1..=100).contains(&self.warn_threshold_percent) {
            return Err(anyhow!("warn_threshold_percent must be within 1..=100"));
        }
        if self.invocation_timeout_secs == 0 {
            return Err(anyhow!("invocation_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if let Some(cmd) = self.verify.command.first()
            && cmd.trim().is_empty()
        {
            return Err(anyhow!("verify.command must start with a program name"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn ready_filter(&self) -> ReadyFilter {
        ReadyFilter {
            epic: self.epic.clone(),
            label: self.label.clone(),
        }
    }

    /// Task store path resolved against `root`.
    pub fn task_store_path(&self, root: &Path) -> PathBuf {
        root.join(&self.task_store)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
        assert_eq!(cfg.harness, "auto");
        assert_eq!(cfg.warn_threshold_percent, 80);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = LoopConfig {
            budget_tokens: Some(50_000),
            on_failure: FailurePolicy::MoveOn,
            label: Some("backend".to_string()),
            verify: VerifyConfig {
                command: vec!["just".to_string(), "ci".to_string()],
                timeout_secs: 60,
            },
            ..LoopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults_and_parses_policies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "harness = \"claude\"\non_failure = \"move-on\"\nclean_state = \"warn\"\n\n[verify]\ncommand = [\"make\", \"test\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.harness, "claude");
        assert_eq!(cfg.on_failure, FailurePolicy::MoveOn);
        assert_eq!(cfg.clean_state, CleanStatePolicy::Warn);
        assert_eq!(cfg.verify.command, vec!["make", "test"]);
        assert_eq!(cfg.verify.timeout_secs, 1800);
        assert_eq!(cfg.max_iterations, 100);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            LoopConfig {
                warn_threshold_percent: 0,
                ..LoopConfig::default()
            },
            LoopConfig {
                invocation_timeout_secs: 0,
                ..LoopConfig::default()
            },
            LoopConfig {
                max_iterations: 0,
                ..LoopConfig::default()
            },
            LoopConfig {
                verify: VerifyConfig {
                    command: vec![" ".to_string()],
                    timeout_secs: 10,
                },
                ..LoopConfig::default()
            },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?} should be rejected");
        }
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "on_failure = \"retry\"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }
}
