//! Static capability table for the supported harnesses.

use serde::Serialize;

use crate::core::types::Capability;

/// What a harness can do. One row per harness id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub harness_id: String,
    pub streaming: bool,
    pub token_reporting: bool,
    pub system_prompt: bool,
    pub auto_mode: bool,
}

impl CapabilityDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Streaming => self.streaming,
            Capability::TokenReporting => self.token_reporting,
            Capability::SystemPrompt => self.system_prompt,
            Capability::AutoMode => self.auto_mode,
        }
    }
}

struct Row {
    id: &'static str,
    streaming: bool,
    token_reporting: bool,
    system_prompt: bool,
    auto_mode: bool,
}

const fn row(
    id: &'static str,
    streaming: bool,
    token_reporting: bool,
    system_prompt: bool,
    auto_mode: bool,
) -> Row {
    Row {
        id,
        streaming,
        token_reporting,
        system_prompt,
        auto_mode,
    }
}

// Order doubles as the auto-detection preference.
const TABLE: &[Row] = &[
    row("claude", true, true, true, true),
    row("opencode", true, true, false, true),
    row("codex", false, false, false, true),
    row("gemini", false, false, false, true),
    row("aider", false, false, false, true),
];

/// Ids of every harness in the table, in preference order.
pub fn known_harnesses() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|r| r.id)
}

/// Descriptor for `harness_id`; unknown ids get an all-false descriptor.
pub fn capabilities_of(harness_id: &str) -> CapabilityDescriptor {
    match TABLE.iter().find(|r| r.id == harness_id) {
        Some(r) => CapabilityDescriptor {
            harness_id: r.id.to_string(),
            streaming: r.streaming,
            token_reporting: r.token_reporting,
            system_prompt: r.system_prompt,
            auto_mode: r.auto_mode,
        },
        None => CapabilityDescriptor {
            harness_id: harness_id.to_string(),
            streaming: false,
            token_reporting: false,
            system_prompt: false,
            auto_mode: false,
        },
    }
}

pub fn supports(harness_id: &str, capability: Capability) -> bool {
    capabilities_of(harness_id).supports(capability)
}
