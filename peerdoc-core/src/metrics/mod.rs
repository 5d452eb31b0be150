//! Metrics for the sync host
//!
//! Only the host records metrics; the core stays free of side effects.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const MESSAGES_SENT: &str = "sync.messages.sent";
pub const MESSAGES_RECEIVED: &str = "sync.messages.received";
pub const MESSAGES_REJECTED: &str = "sync.messages.rejected";
pub const IMPORTS_TOTAL: &str = "sync.imports.total";
pub const IMPORTS_FAILED: &str = "sync.imports.failed";
pub const TIMEOUTS_TOTAL: &str = "sync.timeouts.total";
pub const CHANNELS_ACTIVE: &str = "sync.channels.active";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(MESSAGES_SENT, "Protocol messages handed to channel adapters");
    describe_counter!(MESSAGES_RECEIVED, "Protocol messages accepted from channels");
    describe_counter!(MESSAGES_REJECTED, "Inbound messages dropped by middleware");
    describe_counter!(IMPORTS_TOTAL, "Snapshot/update imports attempted");
    describe_counter!(IMPORTS_FAILED, "Imports that failed to apply");
    describe_counter!(TIMEOUTS_TOTAL, "Request deadlines that fired");
    describe_gauge!(CHANNELS_ACTIVE, "Channels currently registered with the host");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}
