//! Prometheus diagnostic counters for gatewire
//!
//! Exports counters for:
//! - Packet framing on backend connections
//! - Reply state machine transitions and protocol-state errors
//! - Container file blocks, records and bytes read
//!
//! These are diagnostic only. Decoding and routing never read them back.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// WIRE PROTOCOL METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Complete packets extracted from backend byte streams
pub static PACKETS_FRAMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatewire_packets_framed_total",
        "Total number of complete wire packets framed"
    )
    .unwrap()
});

/// Reply state transitions by source and target state
pub static REPLY_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gatewire_reply_transitions_total",
        "Reply state machine transitions",
        &["from", "to"]
    )
    .unwrap()
});

/// Protocol-state errors by kind
pub static PROTOCOL_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gatewire_protocol_errors_total",
        "Unexpected packets and other protocol-state errors",
        &["kind"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// CONTAINER FILE METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Data blocks decoded from container files
pub static CONTAINER_BLOCKS_READ_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatewire_container_blocks_read_total",
        "Total number of container data blocks decoded"
    )
    .unwrap()
});

/// Records decoded from container files
pub static CONTAINER_RECORDS_READ_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatewire_container_records_read_total",
        "Total number of container records decoded"
    )
    .unwrap()
});

/// Compressed payload bytes read from container files
pub static CONTAINER_BYTES_READ_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatewire_container_bytes_read_total",
        "Total number of container payload bytes read"
    )
    .unwrap()
});

/// Blocks rejected because of a sync marker mismatch
pub static CONTAINER_SYNC_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gatewire_container_sync_errors_total",
        "Container blocks rejected by the sync marker check",
        &["kind"]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_packet_framed() {
    PACKETS_FRAMED_TOTAL.inc();
}

pub fn record_reply_transition(from: &str, to: &str) {
    REPLY_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn record_protocol_error(kind: &str) {
    PROTOCOL_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_block_read(payload_bytes: u64) {
    CONTAINER_BLOCKS_READ_TOTAL.inc();
    CONTAINER_BYTES_READ_TOTAL.inc_by(payload_bytes);
}

pub fn record_record_read() {
    CONTAINER_RECORDS_READ_TOTAL.inc();
}

pub fn record_sync_error(kind: &str) {
    CONTAINER_SYNC_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
