use std::sync::Arc;

use akidb_core::{
    CollectionId, CollectionInfo, CollectionSchema, CoreError, DataType, FieldSchema,
    IdAllocator, MetadataStore, PartitionId, SegmentId, SegmentInfo, SegmentKey, SegmentState,
};
use akidb_metadata::{KvBackend, KvIdAllocator, KvMetadataStore, MemoryKvBackend, SqliteKvBackend};

fn collection(id: i64) -> CollectionInfo {
    CollectionInfo::new(
        CollectionId::new(id),
        CollectionSchema {
            name: format!("docs-{id}"),
            fields: vec![
                FieldSchema::scalar("pk", DataType::Int64),
                FieldSchema::vector("embedding", DataType::FloatVector, 128),
            ],
        },
        vec![PartitionId::new(1)],
    )
}

fn growing_segment(id: i64, collection_id: i64) -> SegmentInfo {
    let key = SegmentKey::new(CollectionId::new(collection_id), PartitionId::new(1), "insert-0");
    let mut segment = SegmentInfo::new(SegmentId::new(id), &key, "g0", None, 10_000, 1);
    segment.state = SegmentState::Growing;
    segment
}

async fn sqlite_backend(dir: &tempfile::TempDir) -> Arc<dyn KvBackend> {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("meta.db").display());
    Arc::new(SqliteKvBackend::connect(&url).await.expect("open sqlite kv"))
}

#[tokio::test]
async fn metadata_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let kv = sqlite_backend(&dir).await;
        let store = KvMetadataStore::open(kv, "datacoord/meta")
            .await
            .expect("open store");
        store.add_collection(&collection(7)).await.expect("add collection");
        store
            .add_segment(&growing_segment(100, 7))
            .await
            .expect("add segment");
        store
            .update_segment(
                SegmentId::new(100),
                Box::new(|segment| {
                    segment.next_offset = 950;
                    segment.last_expire_time = 42;
                    Ok(())
                }),
            )
            .await
            .expect("update segment");
    }

    let kv = sqlite_backend(&dir).await;
    let store = KvMetadataStore::open(kv, "datacoord/meta")
        .await
        .expect("reopen store");
    let segment = store
        .get_segment(SegmentId::new(100))
        .await
        .expect("get segment")
        .expect("segment present");
    assert_eq!(segment.state, SegmentState::Growing);
    assert_eq!(segment.next_offset, 950);
    assert_eq!(segment.last_expire_time, 42);
    assert_eq!(
        store
            .get_collection(CollectionId::new(7))
            .await
            .expect("get collection")
            .expect("collection present")
            .schema
            .name,
        "docs-7"
    );
}

#[tokio::test]
async fn concurrent_updates_never_lose_writes() {
    let kv: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
    let store = Arc::new(KvMetadataStore::open(kv, "meta").await.expect("open"));
    store.add_collection(&collection(1)).await.expect("collection");
    store.add_segment(&growing_segment(5, 1)).await.expect("segment");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                store
                    .update_segment(
                        SegmentId::new(5),
                        Box::new(|segment| {
                            segment.next_offset += 1;
                            Ok(())
                        }),
                    )
                    .await
                    .expect("update");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    let segment = store
        .get_segment(SegmentId::new(5))
        .await
        .expect("get")
        .expect("present");
    assert_eq!(segment.next_offset, 400);
}

#[tokio::test]
async fn id_allocator_on_sqlite_never_repeats_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut ids = Vec::new();
    let mut last_ts = 0;

    for _ in 0..2 {
        let kv = sqlite_backend(&dir).await;
        let allocator = KvIdAllocator::open(kv, "datacoord/meta", 8)
            .await
            .expect("open allocator");
        for _ in 0..10 {
            ids.push(allocator.alloc_id().await.expect("id"));
            let ts = allocator.alloc_timestamp().await.expect("ts");
            assert!(ts > last_ts);
            last_ts = ts;
        }
    }

    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len());
}

#[tokio::test]
async fn unavailable_store_rejects_new_segments() {
    let kv = Arc::new(MemoryKvBackend::new());
    let store = KvMetadataStore::open(kv.clone(), "meta").await.expect("open");
    store.add_collection(&collection(1)).await.expect("collection");

    kv.set_unavailable(true);
    let err = store
        .add_segment(&growing_segment(9, 1))
        .await
        .expect_err("store is down");
    assert!(matches!(err, CoreError::MetaUnavailable(_)));
    kv.set_unavailable(false);

    assert!(store
        .get_segment(SegmentId::new(9))
        .await
        .expect("get")
        .is_none());
    assert!(KvMetadataStore::open(kv, "meta").await.is_ok());
}
