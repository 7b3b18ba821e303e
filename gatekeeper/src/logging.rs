//! Diagnostic tracing for the gatekeeper.
//!
//! Tracing output is for operators and developers only. The audit trail of
//! gate decisions lives in [`crate::io::audit`] and is written regardless of
//! `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`, and writes compact lines to stderr
/// so stdout stays machine-readable.
///
/// ```bash
/// RUST_LOG=gatekeeper=debug gatekeeper submit "show disk usage"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
