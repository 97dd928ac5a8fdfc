//! Central metrics registry and metric definitions
//!
//! Metrics are registered lazily on first access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

// ===== Allocation Metrics =====

/// Segment id assignment results by outcome (granted, partial, failed)
pub static SEGMENT_ASSIGNMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "akidb_datacoord_segment_assignments_total",
        "Segment id assignment results",
        &["outcome"]
    )
    .expect("Failed to register segment assignment counter")
});

/// Rows granted across all segments
pub static ROWS_GRANTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "akidb_datacoord_rows_granted_total",
        "Rows granted across all segments"
    )
    .expect("Failed to register rows granted counter")
});

// ===== Segment Lifecycle Metrics =====

/// Segment state transitions by target state
pub static SEGMENT_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "akidb_datacoord_segment_transitions_total",
        "Segment lifecycle transitions",
        &["state"]
    )
    .expect("Failed to register segment transition counter")
});

// ===== Time-Tick Metrics =====

/// Current cluster watermark (hybrid timestamp)
pub static WATERMARK: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "akidb_datacoord_watermark",
        "Cluster-wide time-tick watermark"
    )
    .expect("Failed to register watermark gauge")
});

/// Registered worker nodes
pub static REGISTERED_NODES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "akidb_datacoord_registered_nodes",
        "Number of registered worker nodes"
    )
    .expect("Failed to register node gauge")
});

/// Inbound reports dropped by kind (time_tick, statistics, flush)
pub static DROPPED_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "akidb_datacoord_dropped_reports_total",
        "Inbound reports dropped as stale, duplicate or unknown",
        &["kind"]
    )
    .expect("Failed to register dropped report counter")
});
