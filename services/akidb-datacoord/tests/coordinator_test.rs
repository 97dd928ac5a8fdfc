use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use akidb_core::{
    compose_ts, CollectionId, CollectionInfo, CollectionSchema, CoreError, DataCoordConfig,
    DataType, FieldSchema, NodeId, PartitionId, SegmentState,
};
use akidb_datacoord::{
    CommandQueueClient, DataCoordinator, FlushCompletedMsg, MockIdAllocator, NodeCommand,
    SegmentIdRequest, SegmentStatsMsg, SegmentStatsReport, StateCode, StaticCatalog, TimeTickMsg,
};
use akidb_metadata::{KvMetadataStore, MemoryKvBackend};

const START_MS: u64 = 10_000;

fn docs() -> CollectionInfo {
    // 8 bytes of pk plus 4 * 4 bytes of vector: 24 bytes per row.
    CollectionInfo::new(
        CollectionId::new(1),
        CollectionSchema {
            name: "docs".into(),
            fields: vec![
                FieldSchema::scalar("pk", DataType::Int64),
                FieldSchema::vector("embedding", DataType::FloatVector, 4),
            ],
        },
        vec![PartitionId::new(1)],
    )
}

fn test_config() -> DataCoordConfig {
    let mut config = DataCoordConfig::default();
    config.segment.size_bytes = 24 * 1000;
    config.segment.grant_lifetime_ms = 2000;
    config.cluster.expected_nodes = 1;
    config.cluster.formation_timeout_secs = 5;
    config
}

struct Harness {
    coordinator: Arc<DataCoordinator>,
    ids: Arc<MockIdAllocator>,
    commands: mpsc::Receiver<NodeCommand>,
}

async fn harness(config: DataCoordConfig) -> Harness {
    let meta = Arc::new(
        KvMetadataStore::open(Arc::new(MemoryKvBackend::new()), "test")
            .await
            .unwrap(),
    );
    let ids = Arc::new(MockIdAllocator::new(START_MS));
    let catalog = Arc::new(StaticCatalog::new("dd-test").with_collection(docs()));
    let (client, commands) = CommandQueueClient::new(64);
    let coordinator = Arc::new(DataCoordinator::new(
        config,
        meta,
        ids.clone(),
        catalog,
        Arc::new(client),
    ));
    Harness {
        coordinator,
        ids,
        commands,
    }
}

/// Registers one node, loads the collection and allocates its channels.
async fn ready_harness() -> (Harness, Vec<String>) {
    let h = harness(test_config()).await;
    h.coordinator
        .register_node("node-1:7000", NodeId::new(1))
        .await
        .unwrap();
    h.coordinator.add_collection(&docs()).await.unwrap();
    let channels = h
        .coordinator
        .insert_channels(CollectionId::new(1))
        .await
        .unwrap();
    (h, channels)
}

fn request(channel: &str, count: u64) -> SegmentIdRequest {
    SegmentIdRequest {
        collection_id: CollectionId::new(1),
        partition_id: PartitionId::new(1),
        channel: channel.to_string(),
        count,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_assign_opens_segment_on_first_request() {
    let (h, channels) = ready_harness().await;
    assert_eq!(channels, vec!["insert-channel-1_0", "insert-channel-1_1"]);

    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 100), request(&channels[1], 10)])
        .await;
    assert_eq!(results.len(), 2);

    let first = results[0].result.as_ref().unwrap();
    let second = results[1].result.as_ref().unwrap();
    assert_eq!((first.offset, first.count), (0, 100));
    assert_eq!((second.offset, second.count), (0, 10));
    assert_ne!(first.segment_id, second.segment_id);

    let segments = h
        .coordinator
        .show_segments(CollectionId::new(1), PartitionId::new(1))
        .await
        .unwrap();
    assert_eq!(segments.len(), 2);
}

#[tokio::test]
async fn test_partial_grant_then_rollover() {
    let (h, channels) = ready_harness().await;
    let ch = channels[0].as_str();

    let results = h
        .coordinator
        .assign_segment_ids(vec![request(ch, 950)])
        .await;
    let first = *results[0].result.as_ref().unwrap();

    let results = h
        .coordinator
        .assign_segment_ids(vec![request(ch, 100)])
        .await;
    let partial = *results[0].result.as_ref().unwrap();
    assert_eq!(partial.segment_id, first.segment_id);
    assert_eq!((partial.offset, partial.count), (950, 50));

    let results = h.coordinator.assign_segment_ids(vec![request(ch, 10)]).await;
    let rolled = *results[0].result.as_ref().unwrap();
    assert_ne!(rolled.segment_id, first.segment_id);
    assert_eq!((rolled.offset, rolled.count), (0, 10));

    let full = h.coordinator.allocator().retired_of(&request(ch, 1).key());
    assert_eq!(full, vec![first.segment_id]);
}

#[tokio::test]
async fn test_single_open_per_request_still_opens() {
    let mut config = test_config();
    config.segment.max_open_attempts = 1;
    let h = harness(config).await;
    h.coordinator
        .register_node("node-1:7000", NodeId::new(1))
        .await
        .unwrap();
    h.coordinator.add_collection(&docs()).await.unwrap();
    let channels = h
        .coordinator
        .insert_channels(CollectionId::new(1))
        .await
        .unwrap();
    let ch = channels[0].as_str();

    let results = h.coordinator.assign_segment_ids(vec![request(ch, 1000)]).await;
    let first = *results[0].result.as_ref().unwrap();
    assert_eq!((first.offset, first.count), (0, 1000));

    let results = h.coordinator.assign_segment_ids(vec![request(ch, 10)]).await;
    let rolled = *results[0].result.as_ref().unwrap();
    assert_ne!(rolled.segment_id, first.segment_id);
    assert_eq!((rolled.offset, rolled.count), (0, 10));
}

#[tokio::test]
async fn test_assign_reports_per_item_errors() {
    let (h, channels) = ready_harness().await;
    let mut unknown_partition = request(&channels[0], 5);
    unknown_partition.partition_id = PartitionId::new(9);

    let results = h
        .coordinator
        .assign_segment_ids(vec![
            request(&channels[0], 5),
            unknown_partition,
            request("no-such-channel", 5),
            request(&channels[1], 0),
        ])
        .await;

    assert!(results[0].result.is_ok());
    assert!(matches!(
        results[1].result,
        Err(CoreError::NotFound { entity: "partition", .. })
    ));
    assert!(matches!(
        results[2].result,
        Err(CoreError::NotFound { entity: "channel", .. })
    ));
    assert!(matches!(results[3].result, Err(CoreError::ValidationError(_))));
}

#[tokio::test]
async fn test_open_requires_allocated_channels() {
    let h = harness(test_config()).await;
    h.coordinator.add_collection(&docs()).await.unwrap();
    let err = h
        .coordinator
        .open_new_segment(CollectionId::new(1), PartitionId::new(1), "insert-channel-1_0")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));

    let err = h
        .coordinator
        .insert_channels(CollectionId::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NodeUnavailable { .. }));

    let err = h
        .coordinator
        .insert_channels(CollectionId::new(2))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_second_open_on_key_is_rejected() {
    let (h, channels) = ready_harness().await;
    let opened = h
        .coordinator
        .open_new_segment(CollectionId::new(1), PartitionId::new(1), &channels[0])
        .await
        .unwrap();
    assert_eq!(opened.state, SegmentState::Growing);
    assert_eq!(opened.capacity, 1000);
    assert_eq!(opened.node_id, Some(NodeId::new(1)));

    let err = h
        .coordinator
        .open_new_segment(CollectionId::new(1), PartitionId::new(1), &channels[0])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SegmentAlreadyOpen { segment_id, .. } if segment_id == opened.segment_id));
}

#[tokio::test]
async fn test_flush_reports_unexpired_segments_as_failed() {
    let (h, channels) = ready_harness().await;
    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 10)])
        .await;
    let grant = *results[0].result.as_ref().unwrap();

    let outcome = h.coordinator.flush(CollectionId::new(1)).await.unwrap();
    assert!(!outcome.all_sealed);
    assert_eq!(outcome.failed_segments, vec![grant.segment_id]);

    // The flushed key no longer serves grants from the old segment.
    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 10)])
        .await;
    let next = results[0].result.as_ref().unwrap();
    assert_ne!(next.segment_id, grant.segment_id);

    let states = h.coordinator.segment_states(&[grant.segment_id]).await;
    assert_eq!(states[0].result.as_ref().unwrap().state, SegmentState::Growing);

    assert!(matches!(
        h.coordinator.flush(CollectionId::new(7)).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_time_ticks_seal_and_flush_completion_finishes() {
    let (mut h, channels) = ready_harness().await;
    h.coordinator.start().await.unwrap();
    assert_eq!(h.coordinator.state(), StateCode::Healthy);

    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 10)])
        .await;
    let grant = *results[0].result.as_ref().unwrap();
    let outcome = h.coordinator.flush(CollectionId::new(1)).await.unwrap();
    assert_eq!(outcome.failed_segments, vec![grant.segment_id]);

    // A tick before the grant expires does not seal.
    let ticks = h.coordinator.time_tick_sender();
    let early = compose_ts(START_MS + 500, 0);
    ticks
        .send(TimeTickMsg {
            node_id: NodeId::new(1),
            timestamp: early,
        })
        .await
        .unwrap();
    let coordinator = h.coordinator.clone();
    eventually(|| {
        let coordinator = coordinator.clone();
        async move { coordinator.watermark() == early }
    })
    .await;
    let states = h.coordinator.segment_states(&[grant.segment_id]).await;
    assert_eq!(states[0].result.as_ref().unwrap().state, SegmentState::Growing);

    h.ids.advance_ms(5000);
    let late = compose_ts(START_MS + 5000, 0);
    ticks
        .send(TimeTickMsg {
            node_id: NodeId::new(1),
            timestamp: late,
        })
        .await
        .unwrap();

    let command = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match h.commands.recv().await {
                Some(NodeCommand::FlushSegments { segment_ids, .. }) => break segment_ids,
                Some(_) => continue,
                None => panic!("command queue closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(command, vec![grant.segment_id]);

    let states = h.coordinator.segment_states(&[grant.segment_id]).await;
    let sealed = states[0].result.as_ref().unwrap();
    assert_eq!(sealed.state, SegmentState::Sealed);
    assert_eq!(sealed.sealed_time, late);

    h.coordinator
        .flush_completed_sender()
        .send(FlushCompletedMsg {
            segment_id: grant.segment_id,
            timestamp: late + 1,
        })
        .await
        .unwrap();
    let coordinator = h.coordinator.clone();
    let segment_id = grant.segment_id;
    eventually(|| {
        let coordinator = coordinator.clone();
        async move {
            let states = coordinator.segment_states(&[segment_id]).await;
            matches!(&states[0].result, Ok(info) if info.state == SegmentState::Flushed)
        }
    })
    .await;

    h.coordinator.stop().await;
    assert_eq!(h.coordinator.state(), StateCode::Abnormal);
}

#[tokio::test]
async fn test_reassigned_channels_flush_orphaned_segments() {
    let (mut h, channels) = ready_harness().await;
    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 10)])
        .await;
    let grant = *results[0].result.as_ref().unwrap();

    h.coordinator.deregister_node(NodeId::new(1)).await.unwrap();
    h.ids.advance_ms(5000);
    h.coordinator
        .allocator()
        .seal_ready_segments(compose_ts(START_MS + 5000, 0))
        .await;
    let outcome = h.coordinator.flush(CollectionId::new(1)).await.unwrap();
    assert!(outcome.all_sealed);
    let states = h.coordinator.segment_states(&[grant.segment_id]).await;
    assert_eq!(states[0].result.as_ref().unwrap().state, SegmentState::Sealed);

    h.coordinator
        .register_node("node-2:7000", NodeId::new(2))
        .await
        .unwrap();
    let again = h
        .coordinator
        .insert_channels(CollectionId::new(1))
        .await
        .unwrap();
    assert_eq!(again, channels);

    let (node_id, segment_ids) = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match h.commands.recv().await {
                Some(NodeCommand::FlushSegments {
                    node, segment_ids, ..
                }) => break (node.node_id, segment_ids),
                Some(_) => continue,
                None => panic!("command queue closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(node_id, NodeId::new(2));
    assert_eq!(segment_ids, vec![grant.segment_id]);
}

#[tokio::test]
async fn test_statistics_loop_ignores_duplicates() {
    let (h, channels) = ready_harness().await;
    h.coordinator.start().await.unwrap();

    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[0], 10)])
        .await;
    let segment_id = results[0].result.as_ref().unwrap().segment_id;

    let report = SegmentStatsReport {
        segment_id,
        seq: 1,
        row_delta: 10,
        mem_size: 240,
    };
    let stats = h.coordinator.statistics_sender();
    for _ in 0..2 {
        stats
            .send(SegmentStatsMsg {
                node_id: NodeId::new(1),
                reports: vec![report],
            })
            .await
            .unwrap();
    }
    stats
        .send(SegmentStatsMsg {
            node_id: NodeId::new(1),
            reports: vec![SegmentStatsReport {
                seq: 2,
                row_delta: 5,
                mem_size: 360,
                ..report
            }],
        })
        .await
        .unwrap();

    let coordinator = h.coordinator.clone();
    eventually(|| {
        let coordinator = coordinator.clone();
        async move {
            let totals = coordinator
                .collection_statistics(CollectionId::new(1))
                .await
                .unwrap();
            totals.num_rows == 15
        }
    })
    .await;

    let totals = h
        .coordinator
        .partition_statistics(CollectionId::new(1), PartitionId::new(1))
        .await
        .unwrap();
    assert_eq!((totals.num_rows, totals.mem_size), (15, 360));
    let other = h
        .coordinator
        .partition_statistics(CollectionId::new(1), PartitionId::new(2))
        .await
        .unwrap();
    assert_eq!(other.num_rows, 0);

    h.coordinator.stop().await;
}

#[tokio::test]
async fn test_register_node_returns_start_params() {
    let h = harness(test_config()).await;
    let response = h
        .coordinator
        .register_node("node-1:7000", NodeId::new(11))
        .await
        .unwrap();
    assert_eq!(response.node_id, NodeId::new(11));
    assert_eq!(response.params.dd_channel, "dd-test");
    assert_eq!(response.params.time_tick_channel, h.coordinator.time_tick_channel());
    assert_eq!(response.params.statistics_channel, h.coordinator.statistics_channel());
    assert_eq!(response.params.flush_completed_channel, "datacoord-flush-completed");

    // Same address again resolves to the existing node.
    let again = h
        .coordinator
        .register_node("node-1:7000", NodeId::new(12))
        .await
        .unwrap();
    assert_eq!(again.node_id, NodeId::new(11));

    let states = h.coordinator.component_states();
    assert_eq!(states.state, StateCode::Initializing);
    assert_eq!(states.nodes.len(), 1);
    assert_eq!(states.nodes[0].state, StateCode::Healthy);
    assert_eq!(h.coordinator.barrier().node_count(), 1);

    h.coordinator.deregister_node(NodeId::new(11)).await.unwrap();
    assert_eq!(h.coordinator.barrier().node_count(), 0);
    assert!(h.coordinator.deregister_node(NodeId::new(11)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_silent_nodes_are_reaped() {
    let h = harness(test_config()).await;
    h.coordinator
        .register_node("node-1:7000", NodeId::new(1))
        .await
        .unwrap();
    h.coordinator
        .register_node("node-2:7000", NodeId::new(2))
        .await
        .unwrap();
    assert!(h.coordinator.reap_silent_nodes().is_empty());

    tokio::time::advance(Duration::from_secs(20)).await;
    h.coordinator.cluster().touch(NodeId::new(2));
    tokio::time::advance(Duration::from_secs(15)).await;

    let states = h.coordinator.component_states();
    let node_one = states
        .nodes
        .iter()
        .find(|node| node.node_id == NodeId::new(1))
        .unwrap();
    assert_eq!(node_one.state, StateCode::Abnormal);

    assert_eq!(h.coordinator.reap_silent_nodes(), vec![NodeId::new(1)]);
    assert_eq!(h.coordinator.cluster().node_ids(), vec![NodeId::new(2)]);
    assert_eq!(h.coordinator.barrier().node_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_times_out_without_nodes() {
    let mut config = test_config();
    config.cluster.expected_nodes = 2;
    let h = harness(config).await;
    h.coordinator
        .register_node("node-1:7000", NodeId::new(1))
        .await
        .unwrap();

    let err = h.coordinator.start().await.unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
    assert_eq!(h.coordinator.state(), StateCode::Abnormal);

    let err = h.coordinator.start().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

#[tokio::test]
async fn test_stop_cancels_pending_start() {
    let h = harness(test_config()).await;
    let coordinator = h.coordinator.clone();
    let pending = tokio::spawn(async move { coordinator.start().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.coordinator.stop().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(CoreError::Cancelled(_))));
}

#[tokio::test]
async fn test_start_loads_catalog_collections() {
    let h = harness(test_config()).await;
    h.coordinator
        .register_node("node-1:7000", NodeId::new(1))
        .await
        .unwrap();
    h.coordinator.start().await.unwrap();

    let channels = h
        .coordinator
        .insert_channels(CollectionId::new(1))
        .await
        .unwrap();
    let results = h
        .coordinator
        .assign_segment_ids(vec![request(&channels[1], 3)])
        .await;
    assert_eq!(results[0].result.as_ref().unwrap().count, 3);

    let unknown = h
        .coordinator
        .segment_states(&[akidb_core::SegmentId::new(999)])
        .await;
    assert!(matches!(unknown[0].result, Err(CoreError::NotFound { .. })));

    h.coordinator.stop().await;
}
