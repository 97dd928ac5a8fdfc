//! Cluster watermark over per-node time-ticks.
//!
//! The watermark is the minimum time-tick across registered nodes and never
//! moves backwards. A node joining late starts at the current watermark, so it
//! holds progress at that point until it reports past it; a removed node stops
//! counting immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use akidb_core::metrics::{DROPPED_REPORTS, WATERMARK};
use akidb_core::{NodeId, Timestamp};

use crate::cluster::NodeCluster;
use crate::messages::TimeTickMsg;

#[derive(Debug, Default)]
struct BarrierState {
    nodes: BTreeMap<NodeId, Timestamp>,
    watermark: Timestamp,
}

impl BarrierState {
    /// Raises the watermark to the node minimum. Returns the new value when
    /// it moved.
    fn recompute(&mut self) -> Option<Timestamp> {
        let min = self.nodes.values().copied().min()?;
        if min > self.watermark {
            self.watermark = min;
            return Some(min);
        }
        None
    }
}

pub struct TimeTickBarrier {
    state: Mutex<BarrierState>,
    tx: watch::Sender<Timestamp>,
}

impl Default for TimeTickBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeTickBarrier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            state: Mutex::new(BarrierState::default()),
            tx,
        }
    }

    pub fn watermark(&self) -> Timestamp {
        self.state.lock().watermark
    }

    /// Receiver notified on every watermark advance.
    pub fn subscribe(&self) -> watch::Receiver<Timestamp> {
        self.tx.subscribe()
    }

    /// Starts tracking `node_id`, seeded with the current watermark.
    /// Re-adding a tracked node keeps its last time-tick.
    pub fn add_node(&self, node_id: NodeId) {
        let mut state = self.state.lock();
        let seed = state.watermark;
        state.nodes.entry(node_id).or_insert(seed);
        tracing::debug!(node_id = %node_id, seed, "Barrier tracks node");
    }

    /// Stops tracking `node_id`. Returns the new watermark if removing the
    /// node let it advance.
    pub fn remove_node(&self, node_id: NodeId) -> Option<Timestamp> {
        let advanced = {
            let mut state = self.state.lock();
            if state.nodes.remove(&node_id).is_none() {
                return None;
            }
            state.recompute()
        };
        tracing::debug!(node_id = %node_id, "Barrier dropped node");
        self.publish(advanced)
    }

    /// Records a time-tick. Ticks from untracked nodes are dropped. Returns
    /// the new watermark if it advanced.
    pub fn observe(&self, node_id: NodeId, timestamp: Timestamp) -> Option<Timestamp> {
        let advanced = {
            let mut state = self.state.lock();
            match state.nodes.get_mut(&node_id) {
                Some(last) => *last = (*last).max(timestamp),
                None => {
                    DROPPED_REPORTS.with_label_values(&["time_tick"]).inc();
                    tracing::debug!(
                        node_id = %node_id,
                        timestamp,
                        "Dropped time-tick from untracked node"
                    );
                    return None;
                }
            }
            state.recompute()
        };
        self.publish(advanced)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Last time-tick per tracked node, ordered by node id.
    pub fn node_ticks(&self) -> Vec<(NodeId, Timestamp)> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|(node_id, ts)| (*node_id, *ts))
            .collect()
    }

    fn publish(&self, advanced: Option<Timestamp>) -> Option<Timestamp> {
        let watermark = advanced?;
        // Receivers may lag; only the latest value matters.
        self.tx.send_if_modified(|current| {
            if watermark > *current {
                *current = watermark;
                true
            } else {
                false
            }
        });
        WATERMARK.set(i64::try_from(watermark).unwrap_or(i64::MAX));
        tracing::debug!(watermark, "Watermark advanced");
        Some(watermark)
    }
}

/// Consumes time-ticks until the channel closes or shutdown is signalled.
pub async fn run_time_tick_loop(
    mut ticks: mpsc::Receiver<TimeTickMsg>,
    barrier: Arc<TimeTickBarrier>,
    cluster: Arc<NodeCluster>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Time-tick loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = ticks.recv() => {
                let Some(msg) = msg else { break };
                cluster.touch(msg.node_id);
                barrier.observe(msg.node_id, msg.timestamp);
            }
        }
    }
    tracing::info!("Time-tick loop stopped");
}
