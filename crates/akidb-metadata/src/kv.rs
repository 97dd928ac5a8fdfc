//! Ordered key-value abstraction the metadata store persists through.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use akidb_core::{CoreError, CoreResult};

/// Minimal ordered key-value store.
///
/// Implementations report transport or storage failures as
/// [`CoreError::MetaUnavailable`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<()>;

    async fn delete(&self, key: &str) -> CoreResult<()>;

    /// Returns every entry whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>>;

    /// Writes `value` only if the current value equals `expected`, where
    /// `None` means the key must be absent. Returns whether the write happened.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> CoreResult<bool>;
}

/// In-memory backend for tests and single-process deployments.
///
/// [`MemoryKvBackend::set_unavailable`] makes every call fail, which tests use
/// to exercise store outages.
#[derive(Default)]
pub struct MemoryKvBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated unavailability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::MetaUnavailable(
                "memory kv backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.check_available()?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.check_available()?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        self.check_available()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> CoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.write();
        if entries.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }
}
