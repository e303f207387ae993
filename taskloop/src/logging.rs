//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the product output.
//!
//! - **Run log (`io/run_log`)**: product artifacts in `.taskloop/logs/`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. `debug` raises this crate to `debug`
/// on top of whatever the environment asks for.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=trace taskloop run --once
/// ```
pub fn init(debug: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if debug && let Ok(directive) = "taskloop=debug".parse() {
        filter = filter.add_directive(directive);
    }

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
