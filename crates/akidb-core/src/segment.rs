use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, NodeId, PartitionId, SegmentId};
use crate::timestamp::Timestamp;

/// Allocation key: one growing segment at a time serves each key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,
}

impl SegmentKey {
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            collection_id,
            partition_id,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "collection {} partition {} channel `{}`",
            self.collection_id, self.partition_id, self.channel
        )
    }
}

/// Lifecycle state for a segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Built and persisted, not yet serving allocations.
    New,
    /// Open for allocation (unless superseded).
    Growing,
    /// Closed to allocation, awaiting persistence by the owning node.
    Sealed,
    /// Durably persisted by the owning node.
    Flushed,
}

impl SegmentState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Growing => "growing",
            Self::Sealed => "sealed",
            Self::Flushed => "flushed",
        }
    }

    /// Sealed and flushed segments never change their row range again.
    #[must_use]
    pub const fn is_immutable(&self) -> bool {
        matches!(self, Self::Sealed | Self::Flushed)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// De-duplication state for statistics reports.
///
/// Sequence numbers start at 1. Everything up to `applied_through` has been
/// applied; `applied_above` holds the sparse set of applied sequences past it
/// and collapses back into `applied_through` as gaps fill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsLedger {
    pub applied_through: u64,
    #[serde(default)]
    pub applied_above: BTreeSet<u64>,
    /// Sequence of the report the current memory size came from.
    #[serde(default)]
    pub size_seq: u64,
}

impl StatsLedger {
    /// Marks `seq` applied. Returns `false` when it was applied already.
    pub fn record(&mut self, seq: u64) -> bool {
        if seq <= self.applied_through || !self.applied_above.insert(seq) {
            return false;
        }
        while self.applied_above.remove(&(self.applied_through + 1)) {
            self.applied_through += 1;
        }
        true
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        seq <= self.applied_through || self.applied_above.contains(&seq)
    }
}

/// Persisted segment record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub insert_channel: String,
    /// Name of the channel group the insert channel belongs to.
    pub channel_group: String,
    /// Node watching the channel group when the segment was opened.
    pub node_id: Option<NodeId>,
    pub state: SegmentState,
    pub open_time: Timestamp,
    pub sealed_time: Timestamp,
    pub flushed_time: Timestamp,
    /// Row capacity ceiling.
    pub capacity: u64,
    /// Next row offset to grant; equals the allocated row count.
    pub next_offset: u64,
    /// Expiry of the most recent grant.
    pub last_expire_time: Timestamp,
    /// Closed to new allocation while still growing.
    #[serde(default)]
    pub superseded: bool,
    /// Rows reported written by the owning node.
    pub num_rows: u64,
    /// Memory size reported by the owning node, in bytes.
    pub mem_size: u64,
    #[serde(default)]
    pub stats: StatsLedger,
}

impl SegmentInfo {
    /// Builds a fresh `New` segment record.
    #[must_use]
    pub fn new(
        segment_id: SegmentId,
        key: &SegmentKey,
        channel_group: impl Into<String>,
        node_id: Option<NodeId>,
        capacity: u64,
        open_time: Timestamp,
    ) -> Self {
        Self {
            segment_id,
            collection_id: key.collection_id,
            partition_id: key.partition_id,
            insert_channel: key.channel.clone(),
            channel_group: channel_group.into(),
            node_id,
            state: SegmentState::New,
            open_time,
            sealed_time: 0,
            flushed_time: 0,
            capacity,
            next_offset: 0,
            last_expire_time: 0,
            superseded: false,
            num_rows: 0,
            mem_size: 0,
            stats: StatsLedger::default(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(
            self.collection_id,
            self.partition_id,
            self.insert_channel.clone(),
        )
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.next_offset)
    }

    /// Growing, not superseded, and with room for at least one row.
    #[must_use]
    pub fn is_allocatable(&self) -> bool {
        self.state == SegmentState::Growing && !self.superseded && self.remaining() > 0
    }

    /// Every grant issued on this segment has expired at `watermark`.
    #[must_use]
    pub fn is_safe_to_seal(&self, watermark: Timestamp) -> bool {
        self.last_expire_time <= watermark
    }

    /// Whether reported rows, reported size, or allocation reached the point
    /// where the segment should stop growing.
    #[must_use]
    pub fn reached_seal_threshold(&self, seal_proportion: f64, segment_size_bytes: u64) -> bool {
        self.next_offset >= self.capacity
            || self.num_rows as f64 >= seal_proportion * self.capacity as f64
            || self.mem_size as f64 >= seal_proportion * segment_size_bytes as f64
    }

    /// Applies one statistics report. Returns `false` for a duplicate.
    pub fn apply_stats(&mut self, seq: u64, row_delta: u64, mem_size: u64) -> bool {
        if !self.stats.record(seq) {
            return false;
        }
        self.num_rows = self.num_rows.saturating_add(row_delta);
        if seq > self.stats.size_seq {
            self.stats.size_seq = seq;
            self.mem_size = mem_size;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(capacity: u64) -> SegmentInfo {
        let key = SegmentKey::new(CollectionId::new(1), PartitionId::new(10), "ch-0");
        SegmentInfo::new(SegmentId::new(100), &key, "1-g0", None, capacity, 1)
    }

    #[test]
    fn test_new_segment_is_not_allocatable_until_growing() {
        let mut seg = segment(1000);
        assert_eq!(seg.state, SegmentState::New);
        assert!(!seg.is_allocatable());

        seg.state = SegmentState::Growing;
        assert!(seg.is_allocatable());

        seg.next_offset = 1000;
        assert!(!seg.is_allocatable());
    }

    #[test]
    fn test_ledger_applies_each_sequence_once_in_any_order() {
        let mut ledger = StatsLedger::default();
        assert!(ledger.record(3));
        assert!(ledger.record(1));
        assert!(!ledger.record(3));
        assert!(ledger.record(2));
        assert_eq!(ledger.applied_through, 3);
        assert!(ledger.applied_above.is_empty());
        assert!(!ledger.record(2));
        assert!(!ledger.record(0));
    }

    #[test]
    fn test_apply_stats_sums_deltas_and_keeps_latest_size() {
        let mut seg = segment(1000);
        assert!(seg.apply_stats(2, 50, 4096));
        assert!(seg.apply_stats(1, 30, 1024));
        assert!(!seg.apply_stats(2, 50, 4096));
        assert_eq!(seg.num_rows, 80);
        assert_eq!(seg.mem_size, 4096);
    }

    #[test]
    fn test_seal_threshold() {
        let mut seg = segment(1000);
        assert!(!seg.reached_seal_threshold(0.75, 1 << 20));
        seg.num_rows = 750;
        assert!(seg.reached_seal_threshold(0.75, 1 << 20));

        let mut full = segment(10);
        full.next_offset = 10;
        assert!(full.reached_seal_threshold(0.75, 1 << 20));
    }
}
