//! Metadata store layered over a [`KvBackend`].
//!
//! Records are JSON encoded under `{root}/collection/{id}` and
//! `{root}/segment/{id}`. Reads are served from an in-memory copy that is
//! rebuilt from the backend on open; every write goes to the backend first and
//! only reaches the in-memory copy once persisted, so a failed write leaves
//! both sides unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use akidb_core::{
    CollectionId, CollectionInfo, CoreError, CoreResult, MetadataStore, PartitionId, SegmentId,
    SegmentInfo, SegmentMutation,
};

use crate::kv::KvBackend;

/// Production [`MetadataStore`].
pub struct KvMetadataStore {
    kv: Arc<dyn KvBackend>,
    root: String,
    collections: RwLock<BTreeMap<CollectionId, CollectionInfo>>,
    segments: RwLock<BTreeMap<SegmentId, SegmentInfo>>,
    segment_locks: Mutex<HashMap<SegmentId, Arc<tokio::sync::Mutex<()>>>>,
    collection_lock: tokio::sync::Mutex<()>,
}

impl KvMetadataStore {
    /// Opens the store, loading every record under `root`.
    pub async fn open(kv: Arc<dyn KvBackend>, root: impl Into<String>) -> CoreResult<Self> {
        let root = root.into().trim_end_matches('/').to_string();

        let mut collections = BTreeMap::new();
        for (key, value) in kv.scan_prefix(&format!("{root}/collection/")).await? {
            let info: CollectionInfo = serde_json::from_slice(&value).map_err(|err| {
                CoreError::DeserializationError(format!("collection record `{key}`: {err}"))
            })?;
            collections.insert(info.collection_id, info);
        }

        let mut segments = BTreeMap::new();
        for (key, value) in kv.scan_prefix(&format!("{root}/segment/")).await? {
            let info: SegmentInfo = serde_json::from_slice(&value).map_err(|err| {
                CoreError::DeserializationError(format!("segment record `{key}`: {err}"))
            })?;
            segments.insert(info.segment_id, info);
        }

        tracing::info!(
            root = %root,
            collections = collections.len(),
            segments = segments.len(),
            "Loaded metadata from kv"
        );

        Ok(Self {
            kv,
            root,
            collections: RwLock::new(collections),
            segments: RwLock::new(segments),
            segment_locks: Mutex::new(HashMap::new()),
            collection_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn collection_key(&self, collection_id: CollectionId) -> String {
        format!("{}/collection/{}", self.root, collection_id)
    }

    fn segment_key(&self, segment_id: SegmentId) -> String {
        format!("{}/segment/{}", self.root, segment_id)
    }

    fn segment_lock(&self, segment_id: SegmentId) -> Arc<tokio::sync::Mutex<()>> {
        self.segment_locks
            .lock()
            .entry(segment_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs one segment mutation; the caller holds the segment lock.
    async fn apply_update(
        &self,
        segment_id: SegmentId,
        mutation: SegmentMutation,
    ) -> CoreResult<SegmentInfo> {
        let mut updated = self
            .segments
            .read()
            .get(&segment_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("segment", segment_id))?;
        mutation(&mut updated)?;
        if updated.segment_id != segment_id {
            return Err(CoreError::invalid_state(format!(
                "mutation of segment {segment_id} changed its id"
            )));
        }

        self.persist_segment(&updated).await?;
        self.segments.write().insert(segment_id, updated.clone());
        Ok(updated)
    }

    /// Forgets the lock of `segment_id` if no other update holds or waits on it.
    fn release_segment_lock(&self, segment_id: SegmentId) {
        let mut locks = self.segment_locks.lock();
        if let Some(lock) = locks.get(&segment_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&segment_id);
            }
        }
    }

    async fn persist_segment(&self, segment: &SegmentInfo) -> CoreResult<()> {
        let value = serde_json::to_vec(segment)?;
        self.kv.put(&self.segment_key(segment.segment_id), value).await
    }

    async fn persist_collection(&self, collection: &CollectionInfo) -> CoreResult<()> {
        let value = serde_json::to_vec(collection)?;
        self.kv
            .put(&self.collection_key(collection.collection_id), value)
            .await
    }
}

#[async_trait]
impl MetadataStore for KvMetadataStore {
    async fn add_collection(&self, collection: &CollectionInfo) -> CoreResult<()> {
        let _guard = self.collection_lock.lock().await;
        if self
            .collections
            .read()
            .contains_key(&collection.collection_id)
        {
            return Err(CoreError::already_exists(
                "collection",
                collection.collection_id,
            ));
        }
        collection.schema.estimate_size_per_record()?;

        self.persist_collection(collection).await?;
        self.collections
            .write()
            .insert(collection.collection_id, collection.clone());
        Ok(())
    }

    async fn get_collection(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<Option<CollectionInfo>> {
        Ok(self.collections.read().get(&collection_id).cloned())
    }

    async fn list_collections(&self) -> CoreResult<Vec<CollectionInfo>> {
        Ok(self.collections.read().values().cloned().collect())
    }

    async fn add_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<()> {
        let _guard = self.collection_lock.lock().await;
        let mut updated = self
            .collections
            .read()
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("collection", collection_id))?;
        if updated.has_partition(partition_id) {
            return Ok(());
        }
        updated.partitions.push(partition_id);

        self.persist_collection(&updated).await?;
        self.collections.write().insert(collection_id, updated);
        Ok(())
    }

    async fn add_segment(&self, segment: &SegmentInfo) -> CoreResult<()> {
        let lock = self.segment_lock(segment.segment_id);
        let _guard = lock.lock().await;

        if !self
            .collections
            .read()
            .contains_key(&segment.collection_id)
        {
            return Err(CoreError::not_found("collection", segment.collection_id));
        }
        if self.segments.read().contains_key(&segment.segment_id) {
            return Err(CoreError::already_exists("segment", segment.segment_id));
        }

        self.persist_segment(segment).await?;
        self.segments
            .write()
            .insert(segment.segment_id, segment.clone());
        Ok(())
    }

    async fn get_segment(&self, segment_id: SegmentId) -> CoreResult<Option<SegmentInfo>> {
        Ok(self.segments.read().get(&segment_id).cloned())
    }

    async fn update_segment(
        &self,
        segment_id: SegmentId,
        mutation: SegmentMutation,
    ) -> CoreResult<SegmentInfo> {
        let guard = self.segment_lock(segment_id).lock_owned().await;
        let result = self.apply_update(segment_id, mutation).await;
        drop(guard);
        self.release_segment_lock(segment_id);
        result
    }

    async fn list_segments(&self) -> CoreResult<Vec<SegmentInfo>> {
        Ok(self.segments.read().values().cloned().collect())
    }

    async fn segments_by_collection(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<Vec<SegmentInfo>> {
        Ok(self
            .segments
            .read()
            .values()
            .filter(|segment| segment.collection_id == collection_id)
            .cloned()
            .collect())
    }

    async fn segment_ids_by_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<Vec<SegmentId>> {
        Ok(self
            .segments
            .read()
            .values()
            .filter(|segment| {
                segment.collection_id == collection_id && segment.partition_id == partition_id
            })
            .map(|segment| segment.segment_id)
            .collect())
    }
}
