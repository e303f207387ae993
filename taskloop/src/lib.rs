//! Autonomous task loop for coding-agent CLIs.
//!
//! The loop picks the next ready task from a dependency-aware backlog, hands
//! it to a harness adapter, charges the reported tokens against a budget,
//! verifies the repository and finalizes the task. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scheduling, capabilities, usage
//!   ledger). No I/O, fully testable in isolation.
//! - **[`harness`]**: One adapter per agent CLI behind [`harness::HarnessAdapter`],
//!   including NDJSON stream parsing.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution).
//!
//! [`orchestrator`] ties them together for one [`session::Session`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod harness;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
