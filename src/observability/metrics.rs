//! Metrics collection.
//!
//! # Metrics
//! - `tls_handshakes_total` (counter): completed or failed handshakes by role, outcome
//! - `tls_alerts_sent_total` (counter): fatal alerts we sent, by description
//! - `tls_alerts_received_total` (counter): alerts received from peers
//! - `net_connect_total` (counter): outbound connect attempts by outcome
//! - `scheduler_worker_panics_total` (counter): continuations that panicked
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder
//!   installed every call is a no-op
//! - Labels are static strings to keep cardinality bounded

use metrics::{counter, describe_counter};

pub const HANDSHAKES: &str = "tls_handshakes_total";
pub const ALERTS_SENT: &str = "tls_alerts_sent_total";
pub const ALERTS_RECEIVED: &str = "tls_alerts_received_total";
pub const CONNECTS: &str = "net_connect_total";
pub const WORKER_PANICS: &str = "scheduler_worker_panics_total";

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(HANDSHAKES, "TLS handshakes by role and outcome");
    describe_counter!(ALERTS_SENT, "Fatal TLS alerts sent to peers");
    describe_counter!(ALERTS_RECEIVED, "TLS alerts received from peers");
    describe_counter!(CONNECTS, "Outbound TCP connect attempts by outcome");
    describe_counter!(WORKER_PANICS, "Worker continuations that panicked");
}

pub fn handshake_finished(role: &'static str, outcome: &'static str) {
    counter!(HANDSHAKES, "role" => role, "outcome" => outcome).increment(1);
}

pub fn alert_sent(alert: &'static str) {
    counter!(ALERTS_SENT, "alert" => alert).increment(1);
}

pub fn alert_received() {
    counter!(ALERTS_RECEIVED).increment(1);
}

pub fn connect_finished(outcome: &'static str) {
    counter!(CONNECTS, "outcome" => outcome).increment(1);
}

pub fn worker_panicked() {
    counter!(WORKER_PANICS).increment(1);
}
