use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use akidb_core::{CollectionId, NodeId, SegmentId, SegmentInfo, Timestamp};

use crate::cluster::NodeCluster;
use crate::segment_allocator::SegmentAllocator;
use crate::stats_handler::StatsHandler;

/// Applies watermark advances: seals what became safe, asks owning nodes to
/// flush it, and moves the statistics cut-off forward.
pub struct WatermarkWatcher {
    allocator: Arc<SegmentAllocator>,
    stats: Arc<StatsHandler>,
    cluster: Arc<NodeCluster>,
}

impl WatermarkWatcher {
    pub fn new(
        allocator: Arc<SegmentAllocator>,
        stats: Arc<StatsHandler>,
        cluster: Arc<NodeCluster>,
    ) -> Self {
        Self {
            allocator,
            stats,
            cluster,
        }
    }

    /// Handles one watermark value and returns the segments it sealed.
    pub async fn on_watermark(&self, watermark: Timestamp) -> Vec<SegmentInfo> {
        let sealed = self.allocator.seal_ready_segments(watermark).await;
        request_flush(&self.cluster, &sealed);
        self.stats.set_cutoff(watermark);
        sealed
    }

    pub async fn run(
        self,
        mut watermarks: watch::Receiver<Timestamp>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Watermark watcher started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = watermarks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let watermark = *watermarks.borrow_and_update();
                    self.on_watermark(watermark).await;
                }
            }
        }
        tracing::info!("Watermark watcher stopped");
    }
}

/// Notifies the owning node of each sealed segment, grouped per node and
/// collection. Segments without a registered owner are logged and skipped.
pub fn request_flush(cluster: &NodeCluster, sealed: &[SegmentInfo]) {
    let mut batches: BTreeMap<(NodeId, CollectionId), Vec<SegmentId>> = BTreeMap::new();
    for segment in sealed {
        let owner = segment
            .node_id
            .filter(|node_id| cluster.node(*node_id).is_some())
            .or_else(|| cluster.owner_of(&segment.channel_group));
        match owner {
            Some(node_id) => batches
                .entry((node_id, segment.collection_id))
                .or_default()
                .push(segment.segment_id),
            None => tracing::warn!(
                segment_id = %segment.segment_id,
                group = %segment.channel_group,
                "Sealed segment has no registered owner to flush it"
            ),
        }
    }

    for ((node_id, collection_id), segment_ids) in batches {
        if let Err(err) = cluster.flush_segments(node_id, collection_id, segment_ids) {
            tracing::warn!(node_id = %node_id, error = %err, "Could not request flush");
        }
    }
}
