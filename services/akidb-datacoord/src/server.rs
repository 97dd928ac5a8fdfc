//! Request-facing data coordinator.
//!
//! [`DataCoordinator`] owns every component and exposes the operations the
//! request layer calls. Inbound node traffic arrives on the mpsc senders it
//! hands out and is consumed by the background loops started in
//! [`DataCoordinator::start`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use akidb_core::metrics::SEGMENT_ASSIGNMENTS;
use akidb_core::{
    CollectionId, CollectionInfo, CoreError, CoreResult, DataCoordConfig, IdAllocator,
    MetadataStore, NodeId, PartitionId, SegmentId, SegmentInfo, SegmentKey, SegmentState,
    Timestamp,
};

use crate::catalog::{load_catalog, CatalogClient};
use crate::channel_manager::ChannelManager;
use crate::cluster::{DataNodeClient, NodeCluster, NodeHealth};
use crate::flush_handler::{run_flush_loop, FlushHandler};
use crate::keyed_lock::KeyedLocks;
use crate::messages::{FlushCompletedMsg, SegmentStatsMsg, TimeTickMsg};
use crate::segment_allocator::{AllocatorPolicy, SegmentAllocator, SegmentGrant};
use crate::stats_handler::{run_stats_loop, StatsHandler};
use crate::timetick::{run_time_tick_loop, TimeTickBarrier};
use crate::watcher::{request_flush, WatermarkWatcher};

/// Rows wanted on one (collection, partition, channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIdRequest {
    pub collection_id: CollectionId,
    pub partition_id: PartitionId,
    pub channel: String,
    pub count: u64,
}

impl SegmentIdRequest {
    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(self.collection_id, self.partition_id, self.channel.clone())
    }
}

/// Per-request result of [`DataCoordinator::assign_segment_ids`].
#[derive(Debug)]
pub struct SegmentIdAssignment {
    pub request: SegmentIdRequest,
    pub result: CoreResult<SegmentGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub all_sealed: bool,
    /// Segments still carrying unexpired grants; flush again later.
    pub failed_segments: Vec<SegmentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStateInfo {
    pub segment_id: SegmentId,
    pub state: SegmentState,
    pub open_time: Timestamp,
    pub sealed_time: Timestamp,
    pub flushed_time: Timestamp,
}

/// Per-id result of [`DataCoordinator::segment_states`].
#[derive(Debug)]
pub struct SegmentStateResult {
    pub segment_id: SegmentId,
    pub result: CoreResult<SegmentStateInfo>,
}

/// Channel names a data node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    pub dd_channel: String,
    pub statistics_channel: String,
    pub time_tick_channel: String,
    pub flush_completed_channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_id: NodeId,
    pub coordinator_id: NodeId,
    pub params: StartParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCode {
    Initializing,
    Healthy,
    Abnormal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeComponentState {
    pub node_id: NodeId,
    pub address: String,
    pub state: StateCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStates {
    pub coordinator_id: NodeId,
    pub state: StateCode,
    pub nodes: Vec<NodeComponentState>,
}

/// Row and size totals over a set of segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStatistics {
    pub num_rows: u64,
    pub mem_size: u64,
}

impl SegmentStatistics {
    fn sum<'a>(segments: impl IntoIterator<Item = &'a SegmentInfo>) -> Self {
        segments
            .into_iter()
            .fold(Self::default(), |acc, segment| Self {
                num_rows: acc.num_rows.saturating_add(segment.num_rows),
                mem_size: acc.mem_size.saturating_add(segment.mem_size),
            })
    }
}

struct Inbound {
    time_ticks: mpsc::Receiver<TimeTickMsg>,
    statistics: mpsc::Receiver<SegmentStatsMsg>,
    flush_completions: mpsc::Receiver<FlushCompletedMsg>,
}

pub struct DataCoordinator {
    config: DataCoordConfig,
    meta: Arc<dyn MetadataStore>,
    ids: Arc<dyn IdAllocator>,
    catalog: Arc<dyn CatalogClient>,
    allocator: Arc<SegmentAllocator>,
    barrier: Arc<TimeTickBarrier>,
    stats: Arc<StatsHandler>,
    flushes: Arc<FlushHandler>,
    channels: ChannelManager,
    cluster: Arc<NodeCluster>,
    open_locks: KeyedLocks<SegmentKey>,
    dd_channel: OnceCell<String>,
    state: RwLock<StateCode>,
    time_tick_tx: mpsc::Sender<TimeTickMsg>,
    statistics_tx: mpsc::Sender<SegmentStatsMsg>,
    flush_tx: mpsc::Sender<FlushCompletedMsg>,
    inbound: Mutex<Option<Inbound>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataCoordinator {
    pub fn new(
        config: DataCoordConfig,
        meta: Arc<dyn MetadataStore>,
        ids: Arc<dyn IdAllocator>,
        catalog: Arc<dyn CatalogClient>,
        node_client: Arc<dyn DataNodeClient>,
    ) -> Self {
        let buffer = config.channels.buffer.max(1);
        let (time_tick_tx, time_ticks) = mpsc::channel(buffer);
        let (statistics_tx, statistics) = mpsc::channel(buffer);
        let (flush_tx, flush_completions) = mpsc::channel(buffer);
        let (shutdown, _) = watch::channel(false);

        let allocator = Arc::new(SegmentAllocator::new(
            meta.clone(),
            ids.clone(),
            AllocatorPolicy::from(&config.segment),
        ));

        Self {
            channels: ChannelManager::from_config(&config.channels),
            stats: Arc::new(StatsHandler::new(meta.clone())),
            flushes: Arc::new(FlushHandler::new(meta.clone())),
            cluster: Arc::new(NodeCluster::new(node_client)),
            barrier: Arc::new(TimeTickBarrier::new()),
            allocator,
            config,
            meta,
            ids,
            catalog,
            open_locks: KeyedLocks::new(),
            dd_channel: OnceCell::new(),
            state: RwLock::new(StateCode::Initializing),
            time_tick_tx,
            statistics_tx,
            flush_tx,
            inbound: Mutex::new(Some(Inbound {
                time_ticks,
                statistics,
                flush_completions,
            })),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DataCoordConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.allocator
    }

    pub fn barrier(&self) -> &Arc<TimeTickBarrier> {
        &self.barrier
    }

    pub fn cluster(&self) -> &Arc<NodeCluster> {
        &self.cluster
    }

    pub fn state(&self) -> StateCode {
        *self.state.read()
    }

    pub fn time_tick_sender(&self) -> mpsc::Sender<TimeTickMsg> {
        self.time_tick_tx.clone()
    }

    pub fn statistics_sender(&self) -> mpsc::Sender<SegmentStatsMsg> {
        self.statistics_tx.clone()
    }

    pub fn flush_completed_sender(&self) -> mpsc::Sender<FlushCompletedMsg> {
        self.flush_tx.clone()
    }

    /// Waits for the expected data nodes, loads the catalog, recovers
    /// allocator state and launches the background loops.
    pub async fn start(&self) -> CoreResult<()> {
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| CoreError::invalid_state("data coordinator already started"))?;
        let mut shutdown = self.shutdown.subscribe();

        let prepared: CoreResult<usize> = async {
            let nodes = self
                .cluster
                .wait_for_nodes(
                    self.config.cluster.expected_nodes,
                    self.config.cluster.formation_timeout(),
                    &mut shutdown,
                )
                .await?;
            load_catalog(self.catalog.as_ref(), self.meta.as_ref()).await?;
            self.allocator.recover().await?;
            Ok(nodes)
        }
        .await;

        let nodes = match prepared {
            Ok(nodes) => nodes,
            Err(err) => {
                *self.state.write() = StateCode::Abnormal;
                tracing::error!(error = %err, "Data coordinator failed to start");
                return Err(err);
            }
        };

        let watcher = WatermarkWatcher::new(
            self.allocator.clone(),
            self.stats.clone(),
            self.cluster.clone(),
        );
        let handles = vec![
            tokio::spawn(run_time_tick_loop(
                inbound.time_ticks,
                self.barrier.clone(),
                self.cluster.clone(),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(watcher.run(self.barrier.subscribe(), self.shutdown.subscribe())),
            tokio::spawn(run_stats_loop(
                inbound.statistics,
                self.stats.clone(),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(run_flush_loop(
                inbound.flush_completions,
                self.flushes.clone(),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(run_reaper(
                self.cluster.clone(),
                self.barrier.clone(),
                self.config.cluster.silence_timeout(),
                self.config.cluster.reap_interval(),
                self.shutdown.subscribe(),
            )),
        ];
        self.tasks.lock().extend(handles);

        *self.state.write() = StateCode::Healthy;
        tracing::info!(nodes, "Data coordinator started");
        Ok(())
    }

    /// Signals the background loops to stop and waits for them.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Background loop ended abnormally");
            }
        }
        *self.state.write() = StateCode::Abnormal;
        tracing::info!("Data coordinator stopped");
    }

    /// Records a collection created after startup.
    pub async fn add_collection(&self, collection: &CollectionInfo) -> CoreResult<()> {
        self.meta.add_collection(collection).await
    }

    /// Grants rows for each request independently.
    pub async fn assign_segment_ids(
        &self,
        requests: Vec<SegmentIdRequest>,
    ) -> Vec<SegmentIdAssignment> {
        join_all(requests.into_iter().map(|request| async move {
            let result = self.assign_one(&request).await;
            if let Err(err) = &result {
                SEGMENT_ASSIGNMENTS.with_label_values(&["failed"]).inc();
                tracing::warn!(
                    collection_id = %request.collection_id,
                    partition_id = %request.partition_id,
                    channel = %request.channel,
                    count = request.count,
                    error = %err,
                    "Segment id assignment failed"
                );
            }
            SegmentIdAssignment { request, result }
        }))
        .await
    }

    /// Allocates, opening a new segment and retrying while the key has no
    /// target. At most `max_open_attempts` segments are opened per request.
    async fn assign_one(&self, request: &SegmentIdRequest) -> CoreResult<SegmentGrant> {
        let key = request.key();
        let max_opens = self.config.segment.max_open_attempts;
        let mut opens = 0;
        loop {
            match self.allocator.alloc_segment(&key, request.count).await {
                Err(CoreError::NoGrowingSegment { .. }) if opens < max_opens => {
                    opens += 1;
                    match self
                        .open_new_segment(request.collection_id, request.partition_id, &request.channel)
                        .await
                    {
                        Ok(_) | Err(CoreError::SegmentAlreadyOpen { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
                result => return result,
            }
        }
    }

    /// Builds, persists and opens a new growing segment for a key.
    ///
    /// The collection's insert channels must already be allocated.
    pub async fn open_new_segment(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
        channel: &str,
    ) -> CoreResult<SegmentInfo> {
        let key = SegmentKey::new(collection_id, partition_id, channel);
        let guard = self.open_locks.lock(&key).await;
        let opened = self.open_locked(&key).await;
        drop(guard);
        self.open_locks.release(&key);
        opened
    }

    async fn open_locked(&self, key: &SegmentKey) -> CoreResult<SegmentInfo> {
        let (collection_id, partition_id) = (key.collection_id, key.partition_id);
        if let Some(open) = self.allocator.open_segment_for(key).await? {
            return Err(CoreError::SegmentAlreadyOpen {
                segment_id: open.segment_id,
                key: key.clone(),
            });
        }

        let collection = self.require_collection(collection_id).await?;
        if !collection.has_partition(partition_id) {
            return Err(CoreError::not_found("partition", partition_id));
        }
        let group = self.channels.channel_group(collection_id, &key.channel)?;
        let node_id = self.cluster.owner_of(&group.name);

        let per_record = collection.schema.estimate_size_per_record()?.max(1);
        let capacity = (self.config.segment.size_bytes / per_record).max(1);
        let segment_id = SegmentId::new(self.ids.alloc_id().await?);
        let open_time = self.ids.alloc_timestamp().await?;

        let segment = SegmentInfo::new(segment_id, key, group.name, node_id, capacity, open_time);
        self.meta.add_segment(&segment).await?;
        self.allocator.open_segment(&segment).await
    }

    /// Seals the collection's growing segments, reporting those that cannot
    /// be sealed yet.
    pub async fn flush(&self, collection_id: CollectionId) -> CoreResult<FlushOutcome> {
        self.require_collection(collection_id).await?;
        let outcome = self.allocator.seal_all_segments(collection_id).await;
        request_flush(&self.cluster, &outcome.sealed);
        Ok(FlushOutcome {
            all_sealed: outcome.all_sealed(),
            failed_segments: outcome.failed,
        })
    }

    pub async fn show_segments(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<Vec<SegmentId>> {
        self.meta
            .segment_ids_by_partition(collection_id, partition_id)
            .await
    }

    pub async fn segment_states(&self, segment_ids: &[SegmentId]) -> Vec<SegmentStateResult> {
        let mut results = Vec::with_capacity(segment_ids.len());
        for &segment_id in segment_ids {
            let result = match self.meta.get_segment(segment_id).await {
                Ok(Some(segment)) => Ok(SegmentStateInfo {
                    segment_id,
                    state: segment.state,
                    open_time: segment.open_time,
                    sealed_time: segment.sealed_time,
                    flushed_time: segment.flushed_time,
                }),
                Ok(None) => Err(CoreError::not_found("segment", segment_id)),
                Err(err) => Err(err),
            };
            results.push(SegmentStateResult { segment_id, result });
        }
        results
    }

    /// Insert channels of a collection, allocating and assigning them to
    /// nodes on first use.
    pub async fn insert_channels(&self, collection_id: CollectionId) -> CoreResult<Vec<String>> {
        self.require_collection(collection_id).await?;
        let (groups, _) = self
            .channels
            .alloc_channels(collection_id, self.cluster.node_count())?;
        if groups
            .iter()
            .any(|group| self.cluster.owner_of(&group.name).is_none())
        {
            self.cluster.watch_insert_channels(&groups)?;
            self.reflush_orphaned(collection_id).await;
        }
        Ok(groups.into_iter().flat_map(|group| group.channels).collect())
    }

    /// Requests flushes again for sealed segments whose node is gone, now
    /// that their groups may have an owner.
    async fn reflush_orphaned(&self, collection_id: CollectionId) {
        let segments = match self.meta.segments_by_collection(collection_id).await {
            Ok(segments) => segments,
            Err(err) => {
                tracing::warn!(
                    collection_id = %collection_id,
                    error = %err,
                    "Could not list segments of reassigned channels"
                );
                return;
            }
        };
        let orphaned: Vec<SegmentInfo> = segments
            .into_iter()
            .filter(|segment| {
                segment.state == SegmentState::Sealed
                    && segment
                        .node_id
                        .map_or(true, |node_id| self.cluster.node(node_id).is_none())
            })
            .collect();
        if orphaned.is_empty() {
            return;
        }
        tracing::info!(
            collection_id = %collection_id,
            segments = orphaned.len(),
            "Requesting flush of sealed segments left without an owner"
        );
        request_flush(&self.cluster, &orphaned);
    }

    pub async fn register_node(
        &self,
        address: &str,
        source_id: NodeId,
    ) -> CoreResult<RegisterNodeResponse> {
        let dd_channel = self
            .dd_channel
            .get_or_try_init(|| self.catalog.dd_channel())
            .await?
            .clone();

        let (node, _) = self.cluster.register(address, source_id)?;
        self.barrier.add_node(node.node_id);

        let channels = &self.config.channels;
        Ok(RegisterNodeResponse {
            node_id: node.node_id,
            coordinator_id: NodeId::new(self.config.cluster.coordinator_id),
            params: StartParams {
                dd_channel,
                statistics_channel: channels.statistics.clone(),
                time_tick_channel: channels.time_tick.clone(),
                flush_completed_channel: channels.flush_completed.clone(),
            },
        })
    }

    pub async fn deregister_node(&self, node_id: NodeId) -> CoreResult<()> {
        self.cluster.deregister(node_id)?;
        self.barrier.remove_node(node_id);
        Ok(())
    }

    /// Deregisters nodes silent for longer than the configured timeout.
    pub fn reap_silent_nodes(&self) -> Vec<NodeId> {
        reap_silent(
            &self.cluster,
            &self.barrier,
            self.config.cluster.silence_timeout(),
        )
    }

    pub async fn collection_statistics(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<SegmentStatistics> {
        self.require_collection(collection_id).await?;
        let segments = self.meta.segments_by_collection(collection_id).await?;
        Ok(SegmentStatistics::sum(&segments))
    }

    pub async fn partition_statistics(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<SegmentStatistics> {
        self.require_collection(collection_id).await?;
        let segments = self.meta.segments_by_collection(collection_id).await?;
        Ok(SegmentStatistics::sum(
            segments
                .iter()
                .filter(|segment| segment.partition_id == partition_id),
        ))
    }

    pub fn component_states(&self) -> ComponentStates {
        let nodes = self
            .cluster
            .node_health(self.config.cluster.silence_timeout())
            .into_iter()
            .map(|(node, health)| NodeComponentState {
                node_id: node.node_id,
                address: node.address,
                state: match health {
                    NodeHealth::Healthy => StateCode::Healthy,
                    NodeHealth::Silent => StateCode::Abnormal,
                },
            })
            .collect();
        ComponentStates {
            coordinator_id: NodeId::new(self.config.cluster.coordinator_id),
            state: self.state(),
            nodes,
        }
    }

    pub fn time_tick_channel(&self) -> String {
        self.config.channels.time_tick.clone()
    }

    pub fn statistics_channel(&self) -> String {
        self.config.channels.statistics.clone()
    }

    pub fn watermark(&self) -> Timestamp {
        self.barrier.watermark()
    }

    async fn require_collection(&self, collection_id: CollectionId) -> CoreResult<CollectionInfo> {
        self.meta
            .get_collection(collection_id)
            .await?
            .ok_or_else(|| CoreError::not_found("collection", collection_id))
    }
}

fn reap_silent(
    cluster: &NodeCluster,
    barrier: &TimeTickBarrier,
    silence_timeout: Duration,
) -> Vec<NodeId> {
    let mut reaped = Vec::new();
    for node_id in cluster.silent_nodes(silence_timeout) {
        if cluster.deregister(node_id).is_ok() {
            barrier.remove_node(node_id);
            tracing::warn!(node_id = %node_id, ?silence_timeout, "Deregistered silent data node");
            reaped.push(node_id);
        }
    }
    reaped
}

async fn run_reaper(
    cluster: Arc<NodeCluster>,
    barrier: Arc<TimeTickBarrier>,
    silence_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                reap_silent(&cluster, &barrier, silence_timeout);
            }
        }
    }
    tracing::debug!("Silent node reaper stopped");
}
