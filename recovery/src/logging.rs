//! Diagnostics via `tracing`, written to stderr.
//!
//! Only the binary installs a subscriber. Library callers embedding the
//! recovery subsystem bring their own.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// Reads `RUST_LOG` and falls back to `warn`.
///
/// # Example
/// ```bash
/// RUST_LOG=recovery=debug recovery preflight --task task.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call (e.g. from an embedding host) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
