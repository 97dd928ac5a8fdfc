use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use akidb_core::metrics::{DROPPED_REPORTS, SEGMENT_TRANSITIONS};
use akidb_core::{CoreError, CoreResult, MetadataStore, SegmentState};

use crate::messages::FlushCompletedMsg;

/// What happened to one flush completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCompletion {
    Flushed,
    AlreadyFlushed,
    NotSealed,
    UnknownSegment,
}

/// Moves sealed segments to `Flushed` once their node confirms persistence.
pub struct FlushHandler {
    meta: Arc<dyn MetadataStore>,
}

impl FlushHandler {
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self { meta }
    }

    pub async fn handle(&self, msg: &FlushCompletedMsg) -> CoreResult<FlushCompletion> {
        let Some(segment) = self.meta.get_segment(msg.segment_id).await? else {
            DROPPED_REPORTS.with_label_values(&["flush"]).inc();
            tracing::warn!(segment_id = %msg.segment_id, "Dropped flush completion for unknown segment");
            return Ok(FlushCompletion::UnknownSegment);
        };

        match segment.state {
            SegmentState::Flushed => return Ok(FlushCompletion::AlreadyFlushed),
            SegmentState::Sealed => {}
            state => {
                DROPPED_REPORTS.with_label_values(&["flush"]).inc();
                tracing::warn!(
                    segment_id = %msg.segment_id,
                    state = %state,
                    "Dropped flush completion for segment that is not sealed"
                );
                return Ok(FlushCompletion::NotSealed);
            }
        }

        let flushed_time = msg.timestamp;
        self.meta
            .update_segment(
                msg.segment_id,
                Box::new(move |seg| match seg.state {
                    SegmentState::Sealed => {
                        seg.state = SegmentState::Flushed;
                        seg.flushed_time = flushed_time;
                        Ok(())
                    }
                    SegmentState::Flushed => Ok(()),
                    state => Err(CoreError::invalid_state(format!(
                        "segment {} is {state} and cannot be flushed",
                        seg.segment_id
                    ))),
                }),
            )
            .await?;

        SEGMENT_TRANSITIONS
            .with_label_values(&[SegmentState::Flushed.as_str()])
            .inc();
        tracing::info!(segment_id = %msg.segment_id, flushed_time, "Segment flushed");
        Ok(FlushCompletion::Flushed)
    }
}

/// Consumes flush completions until the channel closes or shutdown is
/// signalled.
pub async fn run_flush_loop(
    mut completions: mpsc::Receiver<FlushCompletedMsg>,
    handler: Arc<FlushHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Flush completion loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = completions.recv() => {
                let Some(msg) = msg else { break };
                if let Err(err) = handler.handle(&msg).await {
                    tracing::error!(segment_id = %msg.segment_id, error = %err, "Failed to record flush completion");
                }
            }
        }
    }
    tracing::info!("Flush completion loop stopped");
}
