//! Applies segment statistics reported by data nodes.
//!
//! Reports may arrive late, out of order or more than once. Each carries a
//! per-segment sequence number and the segment's [`StatsLedger`] applies every
//! sequence once, so totals do not depend on delivery order.
//!
//! [`StatsLedger`]: akidb_core::StatsLedger

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use akidb_core::metrics::DROPPED_REPORTS;
use akidb_core::{CoreResult, MetadataStore, SegmentState, Timestamp};

use crate::messages::{SegmentStatsMsg, SegmentStatsReport};

/// What happened to one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsOutcome {
    Applied,
    Duplicate,
    UnknownSegment,
    /// The segment was flushed at or before the current cut-off.
    Stale,
}

pub struct StatsHandler {
    meta: Arc<dyn MetadataStore>,
    cutoff: AtomicU64,
}

impl StatsHandler {
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            meta,
            cutoff: AtomicU64::new(0),
        }
    }

    /// Raises the watermark cut-off used to recognise stale reports.
    pub fn set_cutoff(&self, watermark: Timestamp) {
        self.cutoff.fetch_max(watermark, Ordering::SeqCst);
    }

    pub fn cutoff(&self) -> Timestamp {
        self.cutoff.load(Ordering::SeqCst)
    }

    pub async fn handle_report(&self, report: &SegmentStatsReport) -> CoreResult<StatsOutcome> {
        let Some(segment) = self.meta.get_segment(report.segment_id).await? else {
            DROPPED_REPORTS.with_label_values(&["statistics"]).inc();
            tracing::warn!(
                segment_id = %report.segment_id,
                seq = report.seq,
                "Dropped statistics for unknown segment"
            );
            return Ok(StatsOutcome::UnknownSegment);
        };

        if segment.state == SegmentState::Flushed && segment.flushed_time <= self.cutoff() {
            DROPPED_REPORTS.with_label_values(&["statistics"]).inc();
            tracing::debug!(segment_id = %report.segment_id, seq = report.seq, "Dropped stale statistics");
            return Ok(StatsOutcome::Stale);
        }
        if segment.stats.contains(report.seq) {
            DROPPED_REPORTS.with_label_values(&["statistics"]).inc();
            tracing::debug!(segment_id = %report.segment_id, seq = report.seq, "Dropped duplicate statistics");
            return Ok(StatsOutcome::Duplicate);
        }

        let SegmentStatsReport {
            seq,
            row_delta,
            mem_size,
            ..
        } = *report;
        let updated = self
            .meta
            .update_segment(
                report.segment_id,
                Box::new(move |seg| {
                    seg.apply_stats(seq, row_delta, mem_size);
                    Ok(())
                }),
            )
            .await?;

        tracing::trace!(
            segment_id = %report.segment_id,
            seq,
            num_rows = updated.num_rows,
            mem_size = updated.mem_size,
            "Applied segment statistics"
        );
        Ok(StatsOutcome::Applied)
    }

    /// Applies every report of a batch, logging failures.
    pub async fn handle_batch(&self, msg: &SegmentStatsMsg) -> Vec<StatsOutcome> {
        let mut outcomes = Vec::with_capacity(msg.reports.len());
        for report in &msg.reports {
            match self.handle_report(report).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(
                    node_id = %msg.node_id,
                    segment_id = %report.segment_id,
                    error = %err,
                    "Failed to apply segment statistics"
                ),
            }
        }
        outcomes
    }
}

/// Consumes statistics batches until the channel closes or shutdown is
/// signalled.
pub async fn run_stats_loop(
    mut batches: mpsc::Receiver<SegmentStatsMsg>,
    handler: Arc<StatsHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Statistics loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = batches.recv() => {
                let Some(msg) = msg else { break };
                handler.handle_batch(&msg).await;
            }
        }
    }
    tracing::info!("Statistics loop stopped");
}
