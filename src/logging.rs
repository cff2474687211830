//! Diagnostic tracing for the orchestrator process.
//!
//! Build and run output does not go through here; it is written to keyed
//! files by [`crate::log_store::LogStore`] and only mirrored into tracing when
//! the corresponding `display*Log` setting is on.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. Reads `RUST_LOG`; defaults to `info`, or
/// `debug` when `verbose` is set. Output goes to stderr.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
