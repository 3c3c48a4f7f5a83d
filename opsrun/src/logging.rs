//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not part of opsrun's product output.
//!
//! - **Transcripts (`pipeline`)**: Step output and status lines delivered to
//!   the caller's sink. Always produced, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=opsrun=debug opsrun docker-cleanup
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
