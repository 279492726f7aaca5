//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber for binaries
//! - Let `RUST_LOG` override the configured filter
//!
//! The library itself only emits events; installing a subscriber is left to
//! the embedding application (or `init_logging` for the bundled CLI).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber. `fallback` is used when `RUST_LOG` is
/// unset or invalid. Safe to call more than once; later calls are no-ops.
pub fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
