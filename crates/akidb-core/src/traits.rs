use async_trait::async_trait;

use crate::collection::CollectionInfo;
use crate::error::CoreResult;
use crate::ids::{CollectionId, PartitionId, SegmentId};
use crate::segment::SegmentInfo;
use crate::timestamp::Timestamp;

/// Source of cluster-unique ids and strictly increasing timestamps.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Returns an id never handed out before, across restarts.
    async fn alloc_id(&self) -> CoreResult<i64>;

    /// Returns a hybrid timestamp greater than every previous one.
    async fn alloc_timestamp(&self) -> CoreResult<Timestamp>;
}

/// In-place edit applied to a segment record inside the store's critical
/// section. Returning an error leaves the stored record untouched.
pub type SegmentMutation = Box<dyn FnOnce(&mut SegmentInfo) -> CoreResult<()> + Send>;

/// Durable record of collections, partitions and segments.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persists a new collection.
    async fn add_collection(&self, collection: &CollectionInfo) -> CoreResult<()>;

    /// Fetches a collection by its identifier.
    async fn get_collection(&self, collection_id: CollectionId)
        -> CoreResult<Option<CollectionInfo>>;

    /// Lists every known collection ordered by id.
    async fn list_collections(&self) -> CoreResult<Vec<CollectionInfo>>;

    /// Adds a partition to an existing collection. Adding a known partition
    /// is a no-op.
    async fn add_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<()>;

    /// Persists a newly built segment.
    async fn add_segment(&self, segment: &SegmentInfo) -> CoreResult<()>;

    /// Fetches a segment by its identifier.
    async fn get_segment(&self, segment_id: SegmentId) -> CoreResult<Option<SegmentInfo>>;

    /// Atomically reads, edits and persists one segment record, returning
    /// the record as stored afterwards.
    async fn update_segment(
        &self,
        segment_id: SegmentId,
        mutation: SegmentMutation,
    ) -> CoreResult<SegmentInfo>;

    /// Lists every segment ordered by id.
    async fn list_segments(&self) -> CoreResult<Vec<SegmentInfo>>;

    /// Lists the segments of one collection ordered by id.
    async fn segments_by_collection(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<Vec<SegmentInfo>>;

    /// Lists the segment ids of one partition ordered by id.
    async fn segment_ids_by_partition(
        &self,
        collection_id: CollectionId,
        partition_id: PartitionId,
    ) -> CoreResult<Vec<SegmentId>>;
}
