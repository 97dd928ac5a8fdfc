//! Worker-node registry.
//!
//! Tracks registered data nodes, their heartbeats and the channel groups each
//! one watches. Notifications to nodes go through [`DataNodeClient`] and are
//! spawned so callers never wait on node I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use akidb_core::metrics::REGISTERED_NODES;
use akidb_core::{CollectionId, CoreError, CoreResult, NodeId, SegmentId};

use crate::channel_manager::ChannelGroup;

/// Snapshot of one registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNodeInfo {
    pub node_id: NodeId,
    pub address: String,
    /// Channel groups assigned to the node, in assignment order.
    pub channel_groups: Vec<String>,
}

/// Outbound calls to data nodes.
#[async_trait]
pub trait DataNodeClient: Send + Sync {
    /// Asks `node` to start consuming the channels of `groups`.
    async fn watch_channels(&self, node: &DataNodeInfo, groups: Vec<ChannelGroup>)
        -> CoreResult<()>;

    /// Asks `node` to persist the given sealed segments.
    async fn flush_segments(
        &self,
        node: &DataNodeInfo,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    ) -> CoreResult<()>;
}

/// Command handed to the transport layer for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    WatchChannels {
        node: DataNodeInfo,
        groups: Vec<ChannelGroup>,
    },
    FlushSegments {
        node: DataNodeInfo,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    },
}

/// [`DataNodeClient`] that queues commands on an mpsc channel.
///
/// Delivery fails once the receiving side is gone.
#[derive(Debug, Clone)]
pub struct CommandQueueClient {
    tx: mpsc::Sender<NodeCommand>,
}

impl CommandQueueClient {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<NodeCommand>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, node_id: NodeId, command: NodeCommand) -> CoreResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoreError::node_unavailable(Some(node_id), "command queue closed"))
    }
}

#[async_trait]
impl DataNodeClient for CommandQueueClient {
    async fn watch_channels(
        &self,
        node: &DataNodeInfo,
        groups: Vec<ChannelGroup>,
    ) -> CoreResult<()> {
        self.send(
            node.node_id,
            NodeCommand::WatchChannels {
                node: node.clone(),
                groups,
            },
        )
        .await
    }

    async fn flush_segments(
        &self,
        node: &DataNodeInfo,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    ) -> CoreResult<()> {
        self.send(
            node.node_id,
            NodeCommand::FlushSegments {
                node: node.clone(),
                collection_id,
                segment_ids,
            },
        )
        .await
    }
}

/// Health of a node as seen from its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Silent,
}

#[derive(Debug)]
struct NodeEntry {
    info: DataNodeInfo,
    last_heartbeat: Instant,
}

pub struct NodeCluster {
    nodes: RwLock<BTreeMap<NodeId, NodeEntry>>,
    group_owners: RwLock<HashMap<String, NodeId>>,
    client: Arc<dyn DataNodeClient>,
    size_tx: watch::Sender<usize>,
}

impl NodeCluster {
    pub fn new(client: Arc<dyn DataNodeClient>) -> Self {
        let (size_tx, _rx) = watch::channel(0);
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            group_owners: RwLock::new(HashMap::new()),
            client,
            size_tx,
        }
    }

    /// Registers a node. Registering an address again returns the existing
    /// node; the boolean is `true` only for a new registration.
    pub fn register(&self, address: &str, source_id: NodeId) -> CoreResult<(DataNodeInfo, bool)> {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.values_mut().find(|entry| entry.info.address == address) {
            entry.last_heartbeat = Instant::now();
            return Ok((entry.info.clone(), false));
        }
        if nodes.contains_key(&source_id) {
            return Err(CoreError::already_exists("node", source_id));
        }

        let info = DataNodeInfo {
            node_id: source_id,
            address: address.to_string(),
            channel_groups: Vec::new(),
        };
        nodes.insert(
            source_id,
            NodeEntry {
                info: info.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        let count = nodes.len();
        drop(nodes);

        self.size_tx.send_replace(count);
        REGISTERED_NODES.set(count as i64);
        tracing::info!(node_id = %source_id, address = %address, nodes = count, "Registered data node");
        Ok((info, true))
    }

    /// Removes a node. Its channel groups are left without an owner.
    pub fn deregister(&self, node_id: NodeId) -> CoreResult<DataNodeInfo> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .remove(&node_id)
            .ok_or_else(|| CoreError::not_found("node", node_id))?;
        let count = nodes.len();
        drop(nodes);

        self.group_owners
            .write()
            .retain(|_, owner| *owner != node_id);
        self.size_tx.send_replace(count);
        REGISTERED_NODES.set(count as i64);
        if !entry.info.channel_groups.is_empty() {
            tracing::warn!(
                node_id = %node_id,
                groups = ?entry.info.channel_groups,
                "Deregistered node owned channel groups; they are left without an owner"
            );
        }
        tracing::info!(node_id = %node_id, nodes = count, "Deregistered data node");
        Ok(entry.info)
    }

    /// Records a heartbeat from `node_id`. Unknown nodes are ignored.
    pub fn touch(&self, node_id: NodeId) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    pub fn node(&self, node_id: NodeId) -> Option<DataNodeInfo> {
        self.nodes.read().get(&node_id).map(|entry| entry.info.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.nodes
            .read()
            .values()
            .map(|entry| entry.info.address.clone())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Nodes with their health given `silence_timeout`.
    pub fn node_health(&self, silence_timeout: Duration) -> Vec<(DataNodeInfo, NodeHealth)> {
        let now = Instant::now();
        self.nodes
            .read()
            .values()
            .map(|entry| {
                let health = if now.duration_since(entry.last_heartbeat) > silence_timeout {
                    NodeHealth::Silent
                } else {
                    NodeHealth::Healthy
                };
                (entry.info.clone(), health)
            })
            .collect()
    }

    /// Nodes whose last heartbeat is older than `silence_timeout`.
    pub fn silent_nodes(&self, silence_timeout: Duration) -> Vec<NodeId> {
        self.node_health(silence_timeout)
            .into_iter()
            .filter(|(_, health)| *health == NodeHealth::Silent)
            .map(|(info, _)| info.node_id)
            .collect()
    }

    /// Node currently watching channel group `group`.
    pub fn owner_of(&self, group: &str) -> Option<NodeId> {
        self.group_owners.read().get(group).copied()
    }

    /// Assigns each group to the node watching the fewest groups and notifies
    /// the owners without waiting for them. Returns `(group, node)` pairs.
    pub fn watch_insert_channels(
        &self,
        groups: &[ChannelGroup],
    ) -> CoreResult<Vec<(String, NodeId)>> {
        let mut assignments = Vec::with_capacity(groups.len());
        let mut per_node: BTreeMap<NodeId, (DataNodeInfo, Vec<ChannelGroup>)> = BTreeMap::new();
        {
            let mut nodes = self.nodes.write();
            if nodes.is_empty() {
                return Err(CoreError::node_unavailable(
                    None,
                    "no data node registered to watch insert channels",
                ));
            }
            let mut owners = self.group_owners.write();
            for group in groups {
                if let Some(owner) = owners.get(&group.name) {
                    assignments.push((group.name.clone(), *owner));
                    continue;
                }
                let Some(entry) = nodes
                    .values_mut()
                    .min_by_key(|entry| (entry.info.channel_groups.len(), entry.info.node_id))
                else {
                    break;
                };
                entry.info.channel_groups.push(group.name.clone());
                owners.insert(group.name.clone(), entry.info.node_id);
                assignments.push((group.name.clone(), entry.info.node_id));
                per_node
                    .entry(entry.info.node_id)
                    .or_insert_with(|| (entry.info.clone(), Vec::new()))
                    .1
                    .push(group.clone());
            }
        }

        for (node_id, (node, node_groups)) in per_node {
            tracing::info!(
                node_id = %node_id,
                groups = node_groups.len(),
                "Assigning channel groups to node"
            );
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(err) = client.watch_channels(&node, node_groups).await {
                    tracing::warn!(node_id = %node.node_id, error = %err, "Watch channels notification failed");
                }
            });
        }
        Ok(assignments)
    }

    /// Asks `node_id` to flush segments without waiting for it.
    pub fn flush_segments(
        &self,
        node_id: NodeId,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    ) -> CoreResult<()> {
        let node = self
            .node(node_id)
            .ok_or_else(|| CoreError::node_unavailable(Some(node_id), "node is not registered"))?;
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client
                .flush_segments(&node, collection_id, segment_ids)
                .await
            {
                tracing::warn!(node_id = %node.node_id, error = %err, "Flush notification failed");
            }
        });
        Ok(())
    }

    /// Waits until at least `expected` nodes are registered.
    ///
    /// Gives up with [`CoreError::Timeout`] after `timeout` and with
    /// [`CoreError::Cancelled`] when `shutdown` fires.
    pub async fn wait_for_nodes(
        &self,
        expected: usize,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CoreResult<usize> {
        let mut size = self.size_tx.subscribe();
        let wait = size.wait_for(|count| *count >= expected);

        tokio::select! {
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok(Ok(count)) => Ok(*count),
                Ok(Err(_)) => Err(CoreError::Cancelled("node registry closed".to_string())),
                Err(_) => Err(CoreError::Timeout(format!(
                    "{} of {expected} data nodes registered after {timeout:?}",
                    self.node_count()
                ))),
            },
            _ = shutdown.wait_for(|stop| *stop) => {
                Err(CoreError::Cancelled("shutdown while waiting for data nodes".to_string()))
            }
        }
    }
}
