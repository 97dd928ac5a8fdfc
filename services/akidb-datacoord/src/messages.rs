//! Decoded records consumed from worker nodes.

use serde::{Deserialize, Serialize};

use akidb_core::{NodeId, SegmentId, Timestamp};

/// "Node `node_id` has processed everything up to `timestamp`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTickMsg {
    pub node_id: NodeId,
    pub timestamp: Timestamp,
}

/// One statistics report for a segment.
///
/// `seq` is assigned by the reporting node per segment, starting at 1.
/// `row_delta` counts rows written since the previous report and `mem_size`
/// is the absolute in-memory size at report time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStatsReport {
    pub segment_id: SegmentId,
    pub seq: u64,
    pub row_delta: u64,
    pub mem_size: u64,
}

/// A batch of statistics reports from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStatsMsg {
    pub node_id: NodeId,
    pub reports: Vec<SegmentStatsReport>,
}

/// The owning node durably persisted a sealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushCompletedMsg {
    pub segment_id: SegmentId,
    pub timestamp: Timestamp,
}
