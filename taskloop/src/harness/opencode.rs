//! Adapter for `opencode run`.
//!
//! With `--format json` opencode emits one event per line. Text parts carry
//! display text; every `step_finish` carries that step's token counts and cost,
//! which are summed across the run. There is no system-prompt channel, so the
//! prompts are combined into a single argument.

use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::instrument;

use super::stream::StreamState;
use super::{HarnessAdapter, InvokeOutcome, InvokeRequest, combined_prompt, run_plain, run_streaming};
use crate::core::types::UsageRecord;

pub const HARNESS_ID: &str = "opencode";

#[derive(Debug, Clone)]
pub struct OpencodeAdapter {
    binary: String,
}

impl OpencodeAdapter {
    pub fn new() -> Self {
        Self::with_binary("opencode")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, request: &InvokeRequest, json: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("run");
        if json {
            cmd.arg("--format").arg("json");
        }
        cmd.arg(combined_prompt(&request.system_prompt, &request.task_prompt));
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Default for OpencodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessAdapter for OpencodeAdapter {
    fn id(&self) -> &str {
        HARNESS_ID
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    #[instrument(skip_all, fields(harness = HARNESS_ID))]
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        run_plain(self.command(request, false), None, request).context("run opencode")
    }

    #[instrument(skip_all, fields(harness = HARNESS_ID))]
    fn invoke_streaming(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        run_streaming(self.command(request, true), None, request, apply_event)
            .context("run opencode (json)")
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum OpencodeEvent {
    Text {
        #[serde(default)]
        part: TextPart,
    },
    ToolUse {
        #[serde(default)]
        part: ToolPart,
    },
    StepFinish {
        #[serde(default)]
        part: StepFinishPart,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TextPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ToolPart {
    #[serde(default)]
    tool: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StepFinishPart {
    #[serde(default)]
    tokens: Option<StepTokens>,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct StepTokens {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
    #[serde(default)]
    reasoning: u64,
    #[serde(default)]
    cache: CacheTokens,
}

#[derive(Debug, Default, Deserialize)]
struct CacheTokens {
    #[serde(default)]
    read: u64,
    #[serde(default)]
    write: u64,
}

pub(crate) fn apply_event(state: &mut StreamState, event: OpencodeEvent) {
    match event {
        OpencodeEvent::Text { part } => state.push_text(&part.text),
        OpencodeEvent::ToolUse { part } => {
            let name = part.tool.as_deref().unwrap_or("unknown");
            state.push_text(&format!("\n[tool: {name}]\n"));
        }
        OpencodeEvent::StepFinish { part } => {
            let mut step = UsageRecord::default();
            if let Some(tokens) = part.tokens {
                step.input_tokens = tokens.input;
                // Reasoning is billed as output.
                step.output_tokens = tokens.output.saturating_add(tokens.reasoning);
                step.cache_read_tokens = tokens.cache.read;
                step.cache_creation_tokens = tokens.cache.write;
            }
            step.cost_usd = part.cost;
            state.add_usage(&step);
        }
        OpencodeEvent::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::stream::events;
    use std::io::Cursor;

    fn fold(input: &str) -> (String, UsageRecord) {
        events::<OpencodeEvent, _>(Cursor::new(input.as_bytes()))
            .fold(StreamState::new(false), |mut state, event| {
                apply_event(&mut state, event);
                state
            })
            .finish()
    }

    #[test]
    fn sums_step_usage_and_cost() {
        let input = concat!(
            r#"{"type":"step_start","part":{}}"#,
            "\n",
            r#"{"type":"text","part":{"text":"Working on it."}}"#,
            "\n",
            r#"{"type":"step_finish","part":{"tokens":{"input":120,"output":30,"reasoning":10,"cache":{"read":5,"write":2}},"cost":0.01}}"#,
            "\n",
            r#"{"type":"tool_use","part":{"tool":"bash"}}"#,
            "\n",
            r#"{"type":"step_finish","part":{"tokens":{"input":80,"output":20},"cost":0.02}}"#,
            "\n"
        );
        let (text, usage) = fold(input);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 60);
        assert_eq!(usage.cache_read_tokens, 5);
        assert_eq!(usage.cache_creation_tokens, 2);
        let cost = usage.cost_usd.expect("cost");
        assert!((cost - 0.03).abs() < 1e-9);
        assert!(!usage.estimated);
        assert!(text.starts_with("Working on it."));
        assert!(text.contains("[tool: bash]"));
    }

    #[test]
    fn cost_only_steps_are_estimated() {
        let (_, usage) = fold(r#"{"type":"step_finish","part":{"cost":0.02}}"#);
        assert!(usage.estimated);
        assert_eq!(usage.total_tokens(), 3_000);
    }

    #[test]
    fn prompt_is_combined_into_argv() {
        let adapter = OpencodeAdapter::new();
        let request = InvokeRequest {
            workdir: std::env::temp_dir(),
            system_prompt: "sys".to_string(),
            task_prompt: "task".to_string(),
            debug: false,
            echo: false,
            timeout: std::time::Duration::from_secs(1),
            output_limit_bytes: 100,
            stream_path: None,
        };
        let args: Vec<String> = adapter
            .command(&request, true)
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["run", "--format", "json", "sys\n\n---\n\ntask"]);
    }
}
