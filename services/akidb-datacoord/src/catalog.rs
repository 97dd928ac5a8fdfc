//! Upstream catalog access.
//!
//! The catalog owns collection and partition definitions. The coordinator
//! reads it once at startup and asks it for the DDL channel name the first
//! time a node registers.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use akidb_core::{
    CollectionId, CollectionInfo, CollectionSchema, CoreError, CoreResult, MetadataStore,
    PartitionId,
};

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Channel carrying DDL events to data nodes.
    async fn dd_channel(&self) -> CoreResult<String>;

    async fn list_collections(&self) -> CoreResult<Vec<CollectionId>>;

    async fn describe_collection(&self, collection_id: CollectionId)
        -> CoreResult<CollectionSchema>;

    async fn list_partitions(&self, collection_id: CollectionId) -> CoreResult<Vec<PartitionId>>;
}

/// Catalog contents as stored in a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub dd_channel: String,
    #[serde(default)]
    pub collections: Vec<CollectionInfo>,
}

/// In-memory [`CatalogClient`] over a fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    dd_channel: String,
    collections: BTreeMap<CollectionId, CollectionInfo>,
}

impl StaticCatalog {
    pub fn new(dd_channel: impl Into<String>) -> Self {
        Self {
            dd_channel: dd_channel.into(),
            collections: BTreeMap::new(),
        }
    }

    pub fn with_collection(mut self, collection: CollectionInfo) -> Self {
        self.collections
            .insert(collection.collection_id, collection);
        self
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        snapshot
            .collections
            .into_iter()
            .fold(Self::new(snapshot.dd_channel), Self::with_collection)
    }

    /// Loads a [`CatalogSnapshot`] from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|err| {
            CoreError::ValidationError(format!("cannot read catalog {}: {err}", path.display()))
        })?;
        let snapshot: CatalogSnapshot = serde_json::from_slice(&raw)?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn collection(&self, collection_id: CollectionId) -> CoreResult<&CollectionInfo> {
        self.collections
            .get(&collection_id)
            .ok_or_else(|| CoreError::not_found("collection", collection_id))
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn dd_channel(&self) -> CoreResult<String> {
        Ok(self.dd_channel.clone())
    }

    async fn list_collections(&self) -> CoreResult<Vec<CollectionId>> {
        Ok(self.collections.keys().copied().collect())
    }

    async fn describe_collection(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<CollectionSchema> {
        Ok(self.collection(collection_id)?.schema.clone())
    }

    async fn list_partitions(&self, collection_id: CollectionId) -> CoreResult<Vec<PartitionId>> {
        Ok(self.collection(collection_id)?.partitions.clone())
    }
}

/// Copies catalog collections and partitions into the metadata store.
///
/// Known collections gain any missing partitions. A collection that fails to
/// load is logged and skipped. Returns the number of collections loaded.
pub async fn load_catalog(
    catalog: &dyn CatalogClient,
    meta: &dyn MetadataStore,
) -> CoreResult<usize> {
    let mut loaded = 0;
    for collection_id in catalog.list_collections().await? {
        match load_collection(catalog, meta, collection_id).await {
            Ok(()) => loaded += 1,
            Err(err) => tracing::warn!(
                collection_id = %collection_id,
                error = %err,
                "Skipping collection from catalog"
            ),
        }
    }
    tracing::info!(collections = loaded, "Loaded catalog");
    Ok(loaded)
}

async fn load_collection(
    catalog: &dyn CatalogClient,
    meta: &dyn MetadataStore,
    collection_id: CollectionId,
) -> CoreResult<()> {
    let partitions = catalog.list_partitions(collection_id).await?;
    if meta.get_collection(collection_id).await?.is_none() {
        let schema = catalog.describe_collection(collection_id).await?;
        let info = CollectionInfo::new(collection_id, schema, partitions);
        return meta.add_collection(&info).await;
    }
    for partition_id in partitions {
        meta.add_partition(collection_id, partition_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use akidb_core::{DataType, FieldSchema};
    use akidb_metadata::{KvMetadataStore, MemoryKvBackend};
    use std::sync::Arc;

    fn info(id: i64, partitions: &[i64], fields: Vec<FieldSchema>) -> CollectionInfo {
        CollectionInfo::new(
            CollectionId::new(id),
            CollectionSchema {
                name: format!("c{id}"),
                fields,
            },
            partitions.iter().copied().map(PartitionId::new).collect(),
        )
    }

    #[tokio::test]
    async fn test_load_skips_invalid_and_merges_partitions() {
        let meta = KvMetadataStore::open(Arc::new(MemoryKvBackend::new()), "t")
            .await
            .unwrap();
        meta.add_collection(&info(1, &[1], vec![FieldSchema::scalar("pk", DataType::Int64)]))
            .await
            .unwrap();

        let catalog = StaticCatalog::new("dd")
            .with_collection(info(1, &[1, 2], vec![FieldSchema::scalar("pk", DataType::Int64)]))
            .with_collection(info(2, &[1], vec![FieldSchema::scalar("pk", DataType::Int64)]))
            .with_collection(info(3, &[1], Vec::new()));

        assert_eq!(load_catalog(&catalog, &meta).await.unwrap(), 2);
        let first = meta.get_collection(CollectionId::new(1)).await.unwrap().unwrap();
        assert_eq!(first.partitions, vec![PartitionId::new(1), PartitionId::new(2)]);
        assert!(meta.get_collection(CollectionId::new(2)).await.unwrap().is_some());
        assert!(meta.get_collection(CollectionId::new(3)).await.unwrap().is_none());
    }

    #[test]
    fn test_snapshot_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"dd_channel":"master-dd","collections":[{"collection_id":5,"schema":{"name":"docs","fields":[{"name":"pk","data_type":"int64","dim":0}]},"partitions":[1]}]}"#,
        )
        .unwrap();
        let catalog = StaticCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.dd_channel, "master-dd");
        assert!(catalog.collections.contains_key(&CollectionId::new(5)));
    }
}
