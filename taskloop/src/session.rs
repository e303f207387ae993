//! Everything one `taskloop run` needs to know, resolved up front.

use std::path::{Path, PathBuf};

use crate::core::capability::{CapabilityDescriptor, capabilities_of};
use crate::core::ledger::UsageLedger;
use crate::core::types::Capability;
use crate::io::config::LoopConfig;
use crate::io::init::LoopPaths;

/// Resolved run parameters. The harness id is fixed for the whole run.
#[derive(Debug, Clone)]
pub struct Session {
    pub paths: LoopPaths,
    pub run_id: String,
    pub harness_id: String,
    pub capabilities: CapabilityDescriptor,
    /// Effective config, CLI overrides applied.
    pub config: LoopConfig,
    /// Stop after one task.
    pub once: bool,
    /// Mirror raw harness output to stderr.
    pub debug: bool,
    /// Print harness display text as it arrives.
    pub echo: bool,
}

impl Session {
    pub fn new(
        root: impl Into<PathBuf>,
        run_id: impl Into<String>,
        harness_id: impl Into<String>,
        config: LoopConfig,
    ) -> Self {
        let harness_id = harness_id.into();
        Self {
            paths: LoopPaths::new(root),
            run_id: run_id.into(),
            capabilities: capabilities_of(&harness_id),
            harness_id,
            config,
            once: false,
            debug: false,
            echo: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn task_store_path(&self) -> PathBuf {
        self.config.task_store_path(self.root())
    }

    pub fn system_prompt_path(&self) -> Option<PathBuf> {
        self.config
            .system_prompt_path
            .as_ref()
            .map(|p| self.root().join(p))
    }

    /// Dispatch to the streaming protocol only when the capability table says so.
    pub fn streaming(&self) -> bool {
        self.capabilities.supports(Capability::Streaming)
    }

    /// Whether the harness reports token usage; without it a budget never trips.
    pub fn reports_tokens(&self) -> bool {
        self.capabilities.supports(Capability::TokenReporting)
    }

    pub fn ledger(&self) -> UsageLedger {
        match self.config.budget_tokens {
            Some(limit) => UsageLedger::new(limit),
            None => UsageLedger::unbounded(),
        }
    }
}
