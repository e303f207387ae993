//! Named collection of harness adapters, plus `auto` resolution.

use anyhow::{Result, bail};
use tracing::debug;

use super::HarnessAdapter;
use super::claude::ClaudeAdapter;
use super::minimal::MinimalAdapter;
use super::opencode::OpencodeAdapter;

/// Config value that asks for the first installed harness.
pub const AUTO: &str = "auto";

/// Adapters keyed by id. Registration order is the detection preference.
#[derive(Default)]
pub struct HarnessRegistry {
    adapters: Vec<Box<dyn HarnessAdapter>>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in adapter, in capability-table order.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ClaudeAdapter::new());
        registry.register(OpencodeAdapter::new());
        registry.register(MinimalAdapter::codex());
        registry.register(MinimalAdapter::gemini());
        registry.register(MinimalAdapter::aider());
        registry
    }

    /// Add an adapter, replacing (in place) any adapter with the same id.
    pub fn register(
        &mut self,
        adapter: impl HarnessAdapter + 'static,
    ) -> Option<Box<dyn HarnessAdapter>> {
        let boxed: Box<dyn HarnessAdapter> = Box::new(adapter);
        match self.adapters.iter().position(|a| a.id() == boxed.id()) {
            Some(idx) => Some(std::mem::replace(&mut self.adapters[idx], boxed)),
            None => {
                self.adapters.push(boxed);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&dyn HarnessAdapter> {
        self.adapters
            .iter()
            .find(|a| a.id() == id)
            .map(|a| a.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve a configured harness id; `auto` picks the first adapter whose
    /// binary is on `PATH`.
    pub fn detect_harness(&self, requested: &str) -> Result<&dyn HarnessAdapter> {
        self.detect_harness_with(requested, |binary| which::which(binary).is_ok())
    }

    /// [`Self::detect_harness`] with an injectable installed-binary check.
    pub fn detect_harness_with(
        &self,
        requested: &str,
        installed: impl Fn(&str) -> bool,
    ) -> Result<&dyn HarnessAdapter> {
        if requested != AUTO {
            return match self.get(requested) {
                Some(adapter) => Ok(adapter),
                None => bail!(
                    "unknown harness '{requested}' (known: {})",
                    self.ids().join(", ")
                ),
            };
        }
        for adapter in &self.adapters {
            let found = installed(adapter.binary());
            debug!(harness = adapter.id(), binary = adapter.binary(), found, "probing harness");
            if found {
                return Ok(adapter.as_ref());
            }
        }
        bail!(
            "no supported harness found on PATH (looked for: {})",
            self.adapters
                .iter()
                .map(|a| a.binary())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}
