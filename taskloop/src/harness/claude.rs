//! Adapter for the `claude` CLI (full-featured backend).
//!
//! Streaming mode runs `claude -p --output-format stream-json --verbose` and
//! reads one JSON event per line. Assistant/message events carry per-message
//! usage that is summed; the closing `result` event carries the final text and
//! the dollar cost.

use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::stream::StreamState;
use super::{HarnessAdapter, InvokeOutcome, InvokeRequest, run_plain, run_streaming};
use crate::core::types::UsageRecord;

pub const HARNESS_ID: &str = "claude";

/// Launches `claude -p` with the task prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    binary: String,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a different executable (tests point this at a fake script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, request: &InvokeRequest, format: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p").arg("--output-format").arg(format);
        if format == "stream-json" {
            // stream-json requires --verbose in print mode.
            cmd.arg("--verbose");
        }
        cmd.arg("--dangerously-skip-permissions");
        if !request.system_prompt.trim().is_empty() {
            cmd.arg("--append-system-prompt").arg(&request.system_prompt);
        }
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessAdapter for ClaudeAdapter {
    fn id(&self) -> &str {
        HARNESS_ID
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    #[instrument(skip_all, fields(harness = HARNESS_ID))]
    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        let cmd = self.command(request, "text");
        run_plain(cmd, Some(request.task_prompt.as_bytes()), request).context("run claude")
    }

    #[instrument(skip_all, fields(harness = HARNESS_ID))]
    fn invoke_streaming(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        let cmd = self.command(request, "stream-json");
        run_streaming(cmd, Some(request.task_prompt.as_bytes()), request, apply_event)
            .context("run claude (stream-json)")
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClaudeEvent {
    Assistant(AssistantEvent),
    Message(AssistantEvent),
    ContentBlockStart {
        #[serde(default)]
        content_block: Option<ContentBlock>,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<Delta>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AssistantEvent {
    #[serde(default)]
    message: Option<AssistantMessage>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<ClaudeUsage> for UsageRecord {
    fn from(u: ClaudeUsage) -> Self {
        UsageRecord {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_input_tokens,
            cache_creation_tokens: u.cache_creation_input_tokens,
            cost_usd: None,
            estimated: false,
        }
    }
}

fn push_block(state: &mut StreamState, block: &ContentBlock) {
    match block.kind.as_str() {
        "tool_use" => {
            let name = block.name.as_deref().unwrap_or("unknown");
            state.push_text(&format!("\n[tool: {name}]\n"));
        }
        _ => {
            if let Some(text) = &block.text {
                state.push_text(text);
            }
        }
    }
}

pub(crate) fn apply_event(state: &mut StreamState, event: ClaudeEvent) {
    match event {
        ClaudeEvent::Assistant(ev) | ClaudeEvent::Message(ev) => {
            let message_usage = ev.message.as_ref().and_then(|m| m.usage);
            if let Some(message) = &ev.message {
                for block in &message.content {
                    push_block(state, block);
                }
            }
            if let Some(usage) = message_usage.or(ev.usage) {
                state.add_usage(&usage.into());
            }
        }
        ClaudeEvent::ContentBlockStart { content_block } => {
            if let Some(block) = content_block {
                push_block(state, &block);
            }
        }
        ClaudeEvent::ContentBlockDelta { delta } => {
            if let Some(text) = delta.and_then(|d| d.text) {
                state.push_text(&text);
            }
        }
        ClaudeEvent::Result {
            result,
            cost_usd,
            total_cost_usd,
        } => {
            if let Some(cost) = total_cost_usd.or(cost_usd) {
                state.set_cost(cost);
            }
            if let Some(text) = result {
                state.set_final_text(&text);
            }
        }
        ClaudeEvent::System { subtype, model } => {
            let subtype = subtype.unwrap_or_else(|| "system".to_string());
            debug!(subtype = %subtype, model = ?model, "claude system event");
            match model {
                Some(model) => state.note(&format!("{subtype}: {model}")),
                None => state.note(&subtype),
            }
        }
        ClaudeEvent::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::stream::events;
    use std::io::Cursor;

    fn fold(input: &str) -> (String, UsageRecord) {
        events::<ClaudeEvent, _>(Cursor::new(input.as_bytes()))
            .fold(StreamState::new(false), |mut state, event| {
                apply_event(&mut state, event);
                state
            })
            .finish()
    }

    #[test]
    fn sums_usage_across_assistant_messages() {
        let input = concat!(
            r#"{"type":"system","subtype":"init","model":"sonnet"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking."}],"usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":7}}}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{}}],"usage":{"input_tokens":200,"output_tokens":75,"cache_creation_input_tokens":3}}}"#,
            "\n",
            r#"{"type":"result","result":"Done.","total_cost_usd":0.02}"#,
            "\n"
        );
        let (text, usage) = fold(input);
        assert_eq!(usage.input_tokens, 300);
        assert_eq!(usage.output_tokens, 125);
        assert_eq!(usage.cache_read_tokens, 7);
        assert_eq!(usage.cache_creation_tokens, 3);
        assert_eq!(usage.cost_usd, Some(0.02));
        assert!(!usage.estimated);
        assert!(text.contains("Looking."));
        assert!(text.contains("[tool: Edit]"));
    }

    #[test]
    fn message_alias_and_top_level_usage() {
        let input = r#"{"type":"message","usage":{"input_tokens":11,"output_tokens":4}}"#;
        let (_, usage) = fold(input);
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 4);
    }

    #[test]
    fn deltas_build_text_and_result_is_fallback() {
        let input = concat!(
            r#"{"type":"content_block_start","content_block":{"type":"text","text":""}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}"#,
            "\n",
            r#"{"type":"result","result":"ignored","cost_usd":0.5}"#
        );
        let (text, _) = fold(input);
        assert_eq!(text, "Hello");

        let (text, _) = fold(r#"{"type":"result","result":"only result"}"#);
        assert_eq!(text, "only result");
    }

    #[test]
    fn cost_without_tokens_is_estimated() {
        let (_, usage) = fold(r#"{"type":"result","result":"ok","cost_usd":0.10}"#);
        assert!(usage.estimated);
        assert_eq!(usage.input_tokens, 5_000);
        assert_eq!(usage.output_tokens, 10_000);
    }

    #[test]
    fn malformed_lines_keep_earlier_usage() {
        let input = concat!(
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":9,"output_tokens":1}}}"#,
            "\n",
            "{\"type\":\"assistant\",\"message\":",
            "\n",
            "garbage\n",
            r#"{"type":"user","message":{"content":"tool output"}}"#,
            "\n"
        );
        let (_, usage) = fold(input);
        assert_eq!(usage.total_tokens(), 10);
    }

    #[test]
    fn command_line_carries_system_prompt_and_auto_mode() {
        let adapter = ClaudeAdapter::with_binary("claude-test");
        let request = InvokeRequest {
            workdir: std::env::temp_dir(),
            system_prompt: "be brief".to_string(),
            task_prompt: "do it".to_string(),
            debug: false,
            echo: false,
            timeout: std::time::Duration::from_secs(1),
            output_limit_bytes: 100,
            stream_path: None,
        };
        let cmd = adapter.command(&request, "stream-json");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "claude-test");
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        let idx = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .expect("system prompt flag");
        assert_eq!(args[idx + 1], "be brief");
    }
}
