use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use akidb_core::config::ChannelConfig;
use akidb_core::{CollectionId, CoreError, CoreResult};

/// Named subset of a collection's insert channels, watched by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub name: String,
    pub collection_id: CollectionId,
    pub channels: Vec<String>,
}

impl ChannelGroup {
    pub fn contains(&self, channel: &str) -> bool {
        self.channels.iter().any(|candidate| candidate == channel)
    }
}

/// Splits each collection's insert channels into groups, once.
///
/// Groups are cached per collection; later node-count changes do not
/// reshape them.
pub struct ChannelManager {
    per_collection: u32,
    prefix: String,
    groups: RwLock<HashMap<CollectionId, Vec<ChannelGroup>>>,
}

impl ChannelManager {
    pub fn new(per_collection: u32, prefix: impl Into<String>) -> Self {
        Self {
            per_collection,
            prefix: prefix.into(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.per_collection, config.insert_prefix.clone())
    }

    pub fn contains_collection(&self, collection_id: CollectionId) -> bool {
        self.groups.read().contains_key(&collection_id)
    }

    pub fn groups(&self, collection_id: CollectionId) -> Option<Vec<ChannelGroup>> {
        self.groups.read().get(&collection_id).cloned()
    }

    /// Returns the collection's groups, creating them over `node_count` nodes
    /// on first call. The boolean is `true` when this call created them.
    ///
    /// Channels are dealt out contiguously; with `n` channels and `g` groups
    /// the first `n % g` groups get one extra channel.
    pub fn alloc_channels(
        &self,
        collection_id: CollectionId,
        node_count: usize,
    ) -> CoreResult<(Vec<ChannelGroup>, bool)> {
        if let Some(existing) = self.groups(collection_id) {
            return Ok((existing, false));
        }
        if node_count == 0 {
            return Err(CoreError::node_unavailable(
                None,
                "cannot allocate insert channels without data nodes",
            ));
        }
        if self.per_collection == 0 {
            return Err(CoreError::ValidationError(
                "insert channels per collection must be positive".to_string(),
            ));
        }

        let mut groups = self.groups.write();
        if let Some(existing) = groups.get(&collection_id) {
            return Ok((existing.clone(), false));
        }

        let channel_count = self.per_collection as usize;
        let group_count = node_count.min(channel_count);
        let base = channel_count / group_count;
        let extra = channel_count % group_count;

        let mut next = 0;
        let mut created = Vec::with_capacity(group_count);
        for index in 0..group_count {
            let size = base + usize::from(index < extra);
            let channels = (next..next + size)
                .map(|i| format!("{}{}_{}", self.prefix, collection_id, i))
                .collect();
            next += size;
            created.push(ChannelGroup {
                name: format!("{collection_id}-group-{index}"),
                collection_id,
                channels,
            });
        }

        tracing::info!(
            collection_id = %collection_id,
            channels = channel_count,
            groups = group_count,
            "Allocated insert channels"
        );
        groups.insert(collection_id, created.clone());
        Ok((created, true))
    }

    /// Group of `collection_id` containing `channel`.
    pub fn channel_group(
        &self,
        collection_id: CollectionId,
        channel: &str,
    ) -> CoreResult<ChannelGroup> {
        let groups = self.groups.read();
        let collection_groups = groups.get(&collection_id).ok_or_else(|| {
            CoreError::invalid_state(format!(
                "insert channels of collection {collection_id} are not allocated"
            ))
        })?;
        collection_groups
            .iter()
            .find(|group| group.contains(channel))
            .cloned()
            .ok_or_else(|| CoreError::not_found("channel", channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(groups: &[ChannelGroup]) -> Vec<usize> {
        groups.iter().map(|group| group.channels.len()).collect()
    }

    #[test]
    fn test_split_gives_leading_groups_the_remainder() {
        let manager = ChannelManager::new(5, "insert-");
        let (groups, created) = manager.alloc_channels(CollectionId::new(3), 2).unwrap();
        assert!(created);
        assert_eq!(sizes(&groups), vec![3, 2]);
        assert_eq!(groups[0].channels[0], "insert-3_0");
        assert_eq!(groups[1].channels, vec!["insert-3_3", "insert-3_4"]);
    }

    #[test]
    fn test_never_more_groups_than_channels() {
        let manager = ChannelManager::new(2, "insert-");
        let (groups, _) = manager.alloc_channels(CollectionId::new(1), 8).unwrap();
        assert_eq!(sizes(&groups), vec![1, 1]);
    }

    #[test]
    fn test_repeat_calls_return_cached_groups() {
        let manager = ChannelManager::new(4, "insert-");
        let (first, _) = manager.alloc_channels(CollectionId::new(1), 2).unwrap();
        let (second, created) = manager.alloc_channels(CollectionId::new(1), 4).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert!(manager.contains_collection(CollectionId::new(1)));
        assert!(!manager.contains_collection(CollectionId::new(2)));
    }

    #[test]
    fn test_channel_lookup() {
        let manager = ChannelManager::new(4, "insert-");
        assert!(matches!(
            manager.channel_group(CollectionId::new(1), "insert-1_0"),
            Err(CoreError::InvalidState { .. })
        ));
        manager.alloc_channels(CollectionId::new(1), 2).unwrap();

        let group = manager
            .channel_group(CollectionId::new(1), "insert-1_3")
            .unwrap();
        assert_eq!(group.name, "1-group-1");
        assert!(matches!(
            manager.channel_group(CollectionId::new(1), "insert-1_9"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_no_nodes_is_an_error() {
        let manager = ChannelManager::new(4, "insert-");
        assert!(matches!(
            manager.alloc_channels(CollectionId::new(1), 0),
            Err(CoreError::NodeUnavailable { .. })
        ));
    }
}
