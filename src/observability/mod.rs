//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! scheduler, sockets, TLS state machine produce:
//!     → logging.rs (structured tracing events: peer, alert, state)
//!     → metrics.rs (handshake, alert, connect and panic counters)
//! ```
//!
//! # Design Decisions
//! - Structured fields over formatted strings
//! - Metrics are cheap (atomic increments) and exporter-agnostic

pub mod logging;
pub mod metrics;
