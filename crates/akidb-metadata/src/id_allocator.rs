//! Cluster-unique ids and hybrid timestamps backed by a [`KvBackend`].
//!
//! Ids are reserved in blocks: the next unreserved id lives under
//! `{root}/id/next` and is advanced with `compare_and_put`, so several
//! coordinators sharing one store never hand out the same id.
//!
//! Timestamps use the wall clock for the physical part. The highest physical
//! value handed out is bounded by a window persisted under `{root}/tso/window`;
//! after a restart the clock starts above the saved window, which keeps
//! timestamps increasing even if the wall clock stepped backwards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use akidb_core::timestamp::LOGICAL_MASK;
use akidb_core::{compose_ts, CoreError, CoreResult, IdAllocator, Timestamp};

use crate::kv::KvBackend;

/// Milliseconds reserved ahead of the clock on each window save.
const TSO_WINDOW_MS: u64 = 3_000;

/// Upper bound on compare-and-put retries when reserving an id block.
const MAX_RESERVE_ATTEMPTS: usize = 16;

#[derive(Debug, Default)]
struct IdBlock {
    next: i64,
    end: i64,
}

#[derive(Debug)]
struct Clock {
    physical: u64,
    logical: u64,
    window_end: u64,
}

/// Persistent [`IdAllocator`].
pub struct KvIdAllocator {
    kv: Arc<dyn KvBackend>,
    id_key: String,
    tso_key: String,
    block_size: i64,
    block: Mutex<IdBlock>,
    clock: Mutex<Clock>,
}

impl KvIdAllocator {
    /// Opens the allocator, restoring the persisted timestamp window.
    pub async fn open(
        kv: Arc<dyn KvBackend>,
        root: &str,
        block_size: u64,
    ) -> CoreResult<Self> {
        if block_size == 0 {
            return Err(CoreError::ValidationError(
                "id block size must be at least 1".to_string(),
            ));
        }
        let root = root.trim_end_matches('/');
        let id_key = format!("{root}/id/next");
        let tso_key = format!("{root}/tso/window");

        let saved_window = match kv.get(&tso_key).await? {
            Some(raw) => decode_u64(&tso_key, &raw)?,
            None => 0,
        };
        tracing::debug!(saved_window, "Restored timestamp window");

        Ok(Self {
            kv,
            id_key,
            tso_key,
            block_size: i64::try_from(block_size)
                .map_err(|_| CoreError::ValidationError("id block size too large".into()))?,
            block: Mutex::new(IdBlock::default()),
            clock: Mutex::new(Clock {
                physical: saved_window,
                logical: 0,
                window_end: saved_window,
            }),
        })
    }

    async fn reserve_block(&self) -> CoreResult<IdBlock> {
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let current = self.kv.get(&self.id_key).await?;
            let start = match &current {
                Some(raw) => decode_i64(&self.id_key, raw)?,
                None => 1,
            };
            let end = start
                .checked_add(self.block_size)
                .ok_or_else(|| CoreError::internal("id space exhausted"))?;

            if self
                .kv
                .compare_and_put(
                    &self.id_key,
                    current.as_deref(),
                    end.to_string().into_bytes(),
                )
                .await?
            {
                tracing::debug!(start, end, "Reserved id block");
                return Ok(IdBlock { next: start, end });
            }
        }
        Err(CoreError::MetaUnavailable(
            "contention while reserving id block".to_string(),
        ))
    }
}

#[async_trait]
impl IdAllocator for KvIdAllocator {
    async fn alloc_id(&self) -> CoreResult<i64> {
        let mut block = self.block.lock().await;
        if block.next >= block.end {
            *block = self.reserve_block().await?;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    async fn alloc_timestamp(&self) -> CoreResult<Timestamp> {
        let mut clock = self.clock.lock().await;
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);

        let (mut physical, mut logical) = if now > clock.physical {
            (now, 0)
        } else {
            (clock.physical, clock.logical + 1)
        };
        if logical > LOGICAL_MASK {
            physical += 1;
            logical = 0;
        }

        if physical >= clock.window_end {
            let window_end = physical + TSO_WINDOW_MS;
            self.kv
                .put(&self.tso_key, window_end.to_string().into_bytes())
                .await?;
            clock.window_end = window_end;
        }

        clock.physical = physical;
        clock.logical = logical;
        Ok(compose_ts(physical, logical))
    }
}

fn decode_i64(key: &str, raw: &[u8]) -> CoreResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| CoreError::DeserializationError(format!("malformed counter at `{key}`")))
}

fn decode_u64(key: &str, raw: &[u8]) -> CoreResult<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| CoreError::DeserializationError(format!("malformed counter at `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvBackend;
    use akidb_core::parse_ts;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_ids_are_unique_across_restarts() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
        let mut seen = HashSet::new();

        let first = KvIdAllocator::open(kv.clone(), "meta", 4).await.unwrap();
        for _ in 0..6 {
            assert!(seen.insert(first.alloc_id().await.unwrap()));
        }
        drop(first);

        let second = KvIdAllocator::open(kv, "meta", 4).await.unwrap();
        for _ in 0..6 {
            assert!(seen.insert(second.alloc_id().await.unwrap()));
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn test_two_allocators_share_one_store() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
        let a = Arc::new(KvIdAllocator::open(kv.clone(), "meta", 3).await.unwrap());
        let b = Arc::new(KvIdAllocator::open(kv, "meta", 3).await.unwrap());

        let mut handles = Vec::new();
        for allocator in [a, b] {
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..20 {
                    ids.push(allocator.alloc_id().await.unwrap());
                }
                ids
            }));
        }
        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 40);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase_and_survive_restart() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
        let allocator = KvIdAllocator::open(kv.clone(), "meta", 10).await.unwrap();

        let mut last = 0;
        for _ in 0..1000 {
            let ts = allocator.alloc_timestamp().await.unwrap();
            assert!(ts > last);
            last = ts;
        }
        drop(allocator);

        let restarted = KvIdAllocator::open(kv, "meta", 10).await.unwrap();
        let ts = restarted.alloc_timestamp().await.unwrap();
        assert!(ts > last);
        assert!(parse_ts(ts).0 >= parse_ts(last).0);
    }

    #[tokio::test]
    async fn test_zero_block_size_is_rejected() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKvBackend::new());
        assert!(matches!(
            KvIdAllocator::open(kv, "meta", 0).await,
            Err(CoreError::ValidationError(_))
        ));
    }
}
