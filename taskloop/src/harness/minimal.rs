//! Adapters for harnesses without an event stream or system-prompt channel.
//!
//! These differ only in executable and flags, so one table-driven adapter
//! covers them all. The prompt is the combined system+task prompt, delivered
//! either on stdin or as the final argument.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::instrument;

use super::{HarnessAdapter, InvokeOutcome, InvokeRequest, combined_prompt, run_plain};

/// How the combined prompt reaches the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    Stdin,
    /// Appended after the fixed arguments.
    Argument,
}

#[derive(Debug, Clone)]
pub struct MinimalAdapter {
    id: String,
    binary: String,
    args: Vec<String>,
    delivery: PromptDelivery,
}

impl MinimalAdapter {
    pub fn new(
        id: impl Into<String>,
        binary: impl Into<String>,
        args: &[&str],
        delivery: PromptDelivery,
    ) -> Self {
        Self {
            id: id.into(),
            binary: binary.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            delivery,
        }
    }

    /// `codex exec`, prompt on stdin.
    pub fn codex() -> Self {
        Self::new(
            "codex",
            "codex",
            &[
                "exec",
                "--sandbox",
                "danger-full-access",
                "--skip-git-repo-check",
                "-",
            ],
            PromptDelivery::Stdin,
        )
    }

    pub fn gemini() -> Self {
        Self::new("gemini", "gemini", &["--yolo", "--prompt"], PromptDelivery::Argument)
    }

    pub fn aider() -> Self {
        Self::new(
            "aider",
            "aider",
            &["--yes-always", "--no-pretty", "--message"],
            PromptDelivery::Argument,
        )
    }

    /// Same flags and delivery, different executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        if self.delivery == PromptDelivery::Argument {
            cmd.arg(prompt);
        }
        cmd
    }
}

impl HarnessAdapter for MinimalAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    #[instrument(skip_all, fields(harness = %self.id))]
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        let prompt = combined_prompt(&request.system_prompt, &request.task_prompt);
        let mut cmd = self.command(&prompt);
        cmd.current_dir(&request.workdir);
        let stdin = match self.delivery {
            PromptDelivery::Stdin => Some(prompt.as_bytes()),
            PromptDelivery::Argument => None,
        };
        run_plain(cmd, stdin, request).with_context(|| format!("run {}", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(workdir: std::path::PathBuf) -> InvokeRequest {
        InvokeRequest {
            workdir,
            system_prompt: "SYSTEM".to_string(),
            task_prompt: "TASK".to_string(),
            debug: false,
            echo: false,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            stream_path: None,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn argument_delivery_appends_prompt() {
        let cmd = MinimalAdapter::aider().command("P");
        assert_eq!(
            args_of(&cmd),
            vec!["--yes-always", "--no-pretty", "--message", "P"]
        );
        let cmd = MinimalAdapter::gemini().command("P");
        assert_eq!(args_of(&cmd), vec!["--yolo", "--prompt", "P"]);
    }

    #[test]
    fn stdin_delivery_keeps_argv_fixed() {
        let cmd = MinimalAdapter::codex().command("P");
        assert_eq!(args_of(&cmd).last().map(String::as_str), Some("-"));
        assert!(!args_of(&cmd).contains(&"P".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn streaming_falls_back_to_plain_with_zero_usage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = MinimalAdapter::new("echo-back", "cat", &[], PromptDelivery::Stdin);
        let outcome = adapter
            .invoke_streaming(&request(temp.path().to_path_buf()))
            .expect("invoke");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.display_text, "SYSTEM\n\n---\n\nTASK");
        assert!(outcome.usage.is_zero());
    }
}
