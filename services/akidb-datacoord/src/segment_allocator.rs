//! Row-id allocation and sealing for growing segments.
//!
//! Each (collection, partition, channel) key has at most one allocation
//! target: a `Growing`, non-superseded segment. Older segments of the key that
//! still hold unexpired grants are kept on a retired list until the watermark
//! passes their last grant expiry, at which point they are sealed.
//!
//! Every operation that reads and then changes a key's segments holds that
//! key's lock, so a grant and a seal of the same segment never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use akidb_core::config::SegmentConfig;
use akidb_core::metrics::{ROWS_GRANTED, SEGMENT_ASSIGNMENTS, SEGMENT_TRANSITIONS};
use akidb_core::{
    add_physical_ms, CollectionId, CoreError, CoreResult, IdAllocator, MetadataStore, SegmentId,
    SegmentInfo, SegmentKey, SegmentState, Timestamp,
};

use crate::keyed_lock::KeyedLocks;

/// Rows `offset..offset + count` of `segment_id`, valid until `expire_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGrant {
    pub segment_id: SegmentId,
    pub offset: u64,
    pub count: u64,
    pub expire_ts: Timestamp,
}

/// Result of sealing every growing segment of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealOutcome {
    /// Segments sealed by this call.
    pub sealed: Vec<SegmentInfo>,
    /// Segments still carrying grants the watermark has not passed, or whose
    /// metadata update failed. Flushing again retries them.
    pub failed: Vec<SegmentId>,
}

impl SealOutcome {
    pub fn all_sealed(&self) -> bool {
        self.failed.is_empty()
    }
}

enum SealStep {
    Sealed(SegmentInfo),
    /// Unexpired grants remain; superseded and left for the background duty.
    Deferred,
    /// No longer growing.
    Skipped,
}

/// Sizing and grant parameters.
#[derive(Debug, Clone)]
pub struct AllocatorPolicy {
    pub segment_size_bytes: u64,
    pub seal_proportion: f64,
    pub grant_lifetime_ms: u64,
}

impl From<&SegmentConfig> for AllocatorPolicy {
    fn from(config: &SegmentConfig) -> Self {
        Self {
            segment_size_bytes: config.size_bytes,
            seal_proportion: config.seal_proportion,
            grant_lifetime_ms: config.grant_lifetime_ms,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct KeyEntry {
    target: Option<SegmentId>,
    retired: BTreeSet<SegmentId>,
}

impl KeyEntry {
    fn is_empty(&self) -> bool {
        self.target.is_none() && self.retired.is_empty()
    }

    fn segment_ids(&self) -> BTreeSet<SegmentId> {
        let mut ids = self.retired.clone();
        ids.extend(self.target);
        ids
    }
}

pub struct SegmentAllocator {
    meta: Arc<dyn MetadataStore>,
    ids: Arc<dyn IdAllocator>,
    policy: AllocatorPolicy,
    key_locks: KeyedLocks<SegmentKey>,
    keys: RwLock<HashMap<SegmentKey, KeyEntry>>,
    watermark: AtomicU64,
}

impl SegmentAllocator {
    pub fn new(
        meta: Arc<dyn MetadataStore>,
        ids: Arc<dyn IdAllocator>,
        policy: AllocatorPolicy,
    ) -> Self {
        Self {
            meta,
            ids,
            policy,
            key_locks: KeyedLocks::new(),
            keys: RwLock::new(HashMap::new()),
            watermark: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &AllocatorPolicy {
        &self.policy
    }

    /// Latest watermark applied to the sealing duty.
    pub fn watermark(&self) -> Timestamp {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Current allocation target of `key`, if any.
    pub fn target_of(&self, key: &SegmentKey) -> Option<SegmentId> {
        self.keys.read().get(key).and_then(|entry| entry.target)
    }

    /// Segments of `key` closed to allocation but not sealed yet.
    pub fn retired_of(&self, key: &SegmentKey) -> Vec<SegmentId> {
        self.keys
            .read()
            .get(key)
            .map(|entry| entry.retired.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the target of `key` if it can still serve a grant.
    pub async fn open_segment_for(&self, key: &SegmentKey) -> CoreResult<Option<SegmentInfo>> {
        let Some(segment_id) = self.target_of(key) else {
            return Ok(None);
        };
        Ok(self
            .meta
            .get_segment(segment_id)
            .await?
            .filter(SegmentInfo::is_allocatable))
    }

    /// Grants up to `count` rows on the target of `key`.
    ///
    /// Grants fewer rows than asked when the target is nearly full. Fails with
    /// [`CoreError::NoGrowingSegment`] when the key has no target or the
    /// target has no room left.
    pub async fn alloc_segment(&self, key: &SegmentKey, count: u64) -> CoreResult<SegmentGrant> {
        if count == 0 {
            return Err(CoreError::ValidationError(
                "row count must be positive".to_string(),
            ));
        }

        let _guard = self.key_locks.lock(key).await;
        let Some(segment) = self.open_segment_for(key).await? else {
            SEGMENT_ASSIGNMENTS
                .with_label_values(&["no_segment"])
                .inc();
            return Err(CoreError::NoGrowingSegment { key: key.clone() });
        };

        let segment_id = segment.segment_id;
        let offset = segment.next_offset;
        let granted = count.min(segment.remaining());
        let alloc_ts = self.ids.alloc_timestamp().await?;
        let expire_ts = add_physical_ms(alloc_ts, self.policy.grant_lifetime_ms);

        self.meta
            .update_segment(
                segment_id,
                Box::new(move |seg| {
                    if seg.next_offset != offset || !seg.is_allocatable() {
                        return Err(CoreError::invalid_state(format!(
                            "segment {} changed while allocating",
                            seg.segment_id
                        )));
                    }
                    seg.next_offset += granted;
                    seg.last_expire_time = seg.last_expire_time.max(expire_ts);
                    Ok(())
                }),
            )
            .await?;

        let outcome = if granted < count { "partial" } else { "granted" };
        SEGMENT_ASSIGNMENTS.with_label_values(&[outcome]).inc();
        ROWS_GRANTED.inc_by(granted);
        tracing::debug!(
            segment_id = %segment_id,
            key = %key,
            offset,
            granted,
            requested = count,
            expire_ts,
            "Granted segment rows"
        );

        Ok(SegmentGrant {
            segment_id,
            offset,
            count: granted,
            expire_ts,
        })
    }

    /// Makes a persisted `New` segment the allocation target of its key.
    ///
    /// The previous target, if any, is superseded: it keeps its rows but
    /// serves no further grants. Fails with [`CoreError::SegmentAlreadyOpen`]
    /// while the previous target still has room.
    pub async fn open_segment(&self, segment: &SegmentInfo) -> CoreResult<SegmentInfo> {
        let segment_id = segment.segment_id;
        let key = segment.key();
        let _guard = self.key_locks.lock(&key).await;

        let stored = self
            .meta
            .get_segment(segment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("segment", segment_id))?;
        if stored.state != SegmentState::New {
            return Err(CoreError::invalid_state(format!(
                "segment {segment_id} is {} and cannot be opened",
                stored.state
            )));
        }

        if let Some(previous_id) = self.target_of(&key) {
            if let Some(previous) = self.meta.get_segment(previous_id).await? {
                if previous.is_allocatable() {
                    return Err(CoreError::SegmentAlreadyOpen {
                        segment_id: previous_id,
                        key,
                    });
                }
                if previous.state == SegmentState::Growing && !previous.superseded {
                    self.supersede(previous_id).await?;
                }
            }
            self.retire_target(&key, previous_id);
        }

        let opened = self
            .meta
            .update_segment(
                segment_id,
                Box::new(|seg| {
                    if seg.state != SegmentState::New {
                        return Err(CoreError::invalid_state(format!(
                            "segment {} is {} and cannot be opened",
                            seg.segment_id, seg.state
                        )));
                    }
                    seg.state = SegmentState::Growing;
                    seg.superseded = false;
                    Ok(())
                }),
            )
            .await?;

        self.keys.write().entry(key.clone()).or_default().target = Some(segment_id);
        SEGMENT_TRANSITIONS
            .with_label_values(&[SegmentState::Growing.as_str()])
            .inc();
        tracing::info!(
            segment_id = %segment_id,
            key = %key,
            capacity = opened.capacity,
            "Opened growing segment"
        );
        Ok(opened)
    }

    /// Seals every growing segment of a collection that the current
    /// watermark makes safe, and supersedes the rest so the background duty
    /// seals them once their grants expire.
    ///
    /// Segments are handled one at a time; a segment whose metadata update
    /// fails is logged and reported in `failed`, and the scan goes on.
    pub async fn seal_all_segments(&self, collection_id: CollectionId) -> SealOutcome {
        let watermark = self.watermark();
        let mut keys: Vec<SegmentKey> = self
            .keys
            .read()
            .keys()
            .filter(|key| key.collection_id == collection_id)
            .cloned()
            .collect();
        keys.sort();

        let mut outcome = SealOutcome::default();
        for key in keys {
            let guard = self.key_locks.lock(&key).await;
            let candidates = match self.keys.read().get(&key) {
                Some(entry) => entry.segment_ids(),
                None => continue,
            };

            for segment_id in candidates {
                match self.seal_or_defer(&key, segment_id, watermark).await {
                    Ok(SealStep::Sealed(segment)) => outcome.sealed.push(segment),
                    Ok(SealStep::Deferred) => outcome.failed.push(segment_id),
                    Ok(SealStep::Skipped) => {}
                    Err(err) => {
                        tracing::warn!(
                            segment_id = %segment_id,
                            key = %key,
                            error = %err,
                            "Failed to seal segment during flush"
                        );
                        outcome.failed.push(segment_id);
                    }
                }
            }

            let pruned = self.prune(&key);
            drop(guard);
            if pruned {
                self.key_locks.release(&key);
            }
        }

        outcome.failed.sort();
        tracing::info!(
            collection_id = %collection_id,
            watermark,
            sealed = outcome.sealed.len(),
            failed = outcome.failed.len(),
            "Sealed collection segments"
        );
        outcome
    }

    /// Seals one segment of `key` if `watermark` makes it safe, otherwise
    /// supersedes and retires it. Caller holds the key lock.
    async fn seal_or_defer(
        &self,
        key: &SegmentKey,
        segment_id: SegmentId,
        watermark: Timestamp,
    ) -> CoreResult<SealStep> {
        let segment = match self.meta.get_segment(segment_id).await? {
            Some(segment) if segment.state == SegmentState::Growing => segment,
            _ => {
                self.forget(key, segment_id);
                return Ok(SealStep::Skipped);
            }
        };

        if segment.is_safe_to_seal(watermark) {
            let sealed = self.seal(segment_id, watermark).await?;
            self.forget(key, segment_id);
            return Ok(SealStep::Sealed(sealed));
        }
        if !segment.superseded {
            self.supersede(segment_id).await?;
        }
        self.retire_target(key, segment_id);
        Ok(SealStep::Deferred)
    }

    /// Background sealing duty, run on every watermark advance.
    ///
    /// Supersedes targets that crossed a size or row threshold, then seals
    /// every superseded segment whose last grant expired at or before
    /// `watermark`. Failures are logged per key and do not stop the scan.
    pub async fn seal_ready_segments(&self, watermark: Timestamp) -> Vec<SegmentInfo> {
        let previous = self.watermark.fetch_max(watermark, Ordering::SeqCst);
        let watermark = previous.max(watermark);

        let mut keys: Vec<SegmentKey> = self.keys.read().keys().cloned().collect();
        keys.sort();

        let mut sealed = Vec::new();
        for key in keys {
            let guard = self.key_locks.lock(&key).await;
            match self.seal_ready_for_key(&key, watermark).await {
                Ok(mut segments) => sealed.append(&mut segments),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "Sealing scan failed for key");
                }
            }
            let pruned = self.prune(&key);
            drop(guard);
            if pruned {
                self.key_locks.release(&key);
            }
        }

        if !sealed.is_empty() {
            tracing::info!(watermark, sealed = sealed.len(), "Sealed segments behind watermark");
        }
        sealed
    }

    async fn seal_ready_for_key(
        &self,
        key: &SegmentKey,
        watermark: Timestamp,
    ) -> CoreResult<Vec<SegmentInfo>> {
        let entry = match self.keys.read().get(key) {
            Some(entry) => entry.clone(),
            None => return Ok(Vec::new()),
        };

        if let Some(target_id) = entry.target {
            match self.meta.get_segment(target_id).await? {
                Some(target) if target.state == SegmentState::Growing => {
                    let full = target.superseded
                        || target.reached_seal_threshold(
                            self.policy.seal_proportion,
                            self.policy.segment_size_bytes,
                        );
                    if full {
                        if !target.superseded {
                            self.supersede(target_id).await?;
                        }
                        self.retire_target(key, target_id);
                    }
                }
                _ => self.forget(key, target_id),
            }
        }

        let retired = self.retired_of(key);
        let mut sealed = Vec::new();
        for segment_id in retired {
            let segment = match self.meta.get_segment(segment_id).await? {
                Some(segment) if segment.state == SegmentState::Growing => segment,
                _ => {
                    self.forget(key, segment_id);
                    continue;
                }
            };
            if !segment.is_safe_to_seal(watermark) {
                continue;
            }
            match self.seal(segment_id, watermark).await {
                Ok(segment) => {
                    sealed.push(segment);
                    self.forget(key, segment_id);
                }
                Err(err) => {
                    tracing::warn!(segment_id = %segment_id, error = %err, "Failed to seal segment");
                }
            }
        }
        Ok(sealed)
    }

    /// Rebuilds the key index from metadata after a restart.
    ///
    /// The newest non-superseded growing segment of each key becomes its
    /// target; older growing segments are superseded and retired. Returns the
    /// number of keys tracked.
    pub async fn recover(&self) -> CoreResult<usize> {
        let segments = self.meta.list_segments().await?;

        let mut watermark_floor = 0;
        let mut by_key: HashMap<SegmentKey, Vec<SegmentInfo>> = HashMap::new();
        for segment in segments {
            match segment.state {
                SegmentState::Growing => by_key.entry(segment.key()).or_default().push(segment),
                SegmentState::Sealed | SegmentState::Flushed => {
                    watermark_floor = watermark_floor.max(segment.sealed_time);
                }
                SegmentState::New => {}
            }
        }

        let mut rebuilt = HashMap::with_capacity(by_key.len());
        for (key, mut segments) in by_key {
            segments.sort_by_key(|segment| (segment.open_time, segment.segment_id));
            let target = segments
                .iter()
                .rev()
                .find(|segment| !segment.superseded)
                .map(|segment| segment.segment_id);

            let mut entry = KeyEntry {
                target,
                retired: BTreeSet::new(),
            };
            for segment in &segments {
                if Some(segment.segment_id) == target {
                    continue;
                }
                if !segment.superseded {
                    self.supersede(segment.segment_id).await?;
                }
                entry.retired.insert(segment.segment_id);
            }
            rebuilt.insert(key, entry);
        }

        let tracked = rebuilt.len();
        *self.keys.write() = rebuilt;
        self.watermark.fetch_max(watermark_floor, Ordering::SeqCst);
        tracing::info!(keys = tracked, watermark_floor, "Recovered allocator state");
        Ok(tracked)
    }

    async fn supersede(&self, segment_id: SegmentId) -> CoreResult<SegmentInfo> {
        self.meta
            .update_segment(
                segment_id,
                Box::new(|seg| {
                    if seg.state == SegmentState::Growing {
                        seg.superseded = true;
                    }
                    Ok(())
                }),
            )
            .await
    }

    /// Seals a growing segment. Sealing a sealed or flushed segment leaves it
    /// unchanged.
    async fn seal(&self, segment_id: SegmentId, sealed_time: Timestamp) -> CoreResult<SegmentInfo> {
        let segment = self
            .meta
            .update_segment(
                segment_id,
                Box::new(move |seg| {
                    if seg.state.is_immutable() {
                        return Ok(());
                    }
                    if seg.state != SegmentState::Growing {
                        return Err(CoreError::invalid_state(format!(
                            "segment {} is {} and cannot be sealed",
                            seg.segment_id, seg.state
                        )));
                    }
                    if !seg.is_safe_to_seal(sealed_time) {
                        return Err(CoreError::invalid_state(format!(
                            "segment {} has grants expiring after {sealed_time}",
                            seg.segment_id
                        )));
                    }
                    seg.state = SegmentState::Sealed;
                    seg.superseded = true;
                    seg.sealed_time = sealed_time;
                    Ok(())
                }),
            )
            .await?;

        SEGMENT_TRANSITIONS
            .with_label_values(&[SegmentState::Sealed.as_str()])
            .inc();
        tracing::info!(
            segment_id = %segment_id,
            rows = segment.next_offset,
            sealed_time,
            "Sealed segment"
        );
        Ok(segment)
    }

    fn retire_target(&self, key: &SegmentKey, segment_id: SegmentId) {
        let mut keys = self.keys.write();
        let entry = keys.entry(key.clone()).or_default();
        if entry.target == Some(segment_id) {
            entry.target = None;
        }
        entry.retired.insert(segment_id);
    }

    fn forget(&self, key: &SegmentKey, segment_id: SegmentId) {
        if let Some(entry) = self.keys.write().get_mut(key) {
            if entry.target == Some(segment_id) {
                entry.target = None;
            }
            entry.retired.remove(&segment_id);
        }
    }

    fn prune(&self, key: &SegmentKey) -> bool {
        let mut keys = self.keys.write();
        if keys.get(key).is_some_and(KeyEntry::is_empty) {
            keys.remove(key);
            return true;
        }
        false
    }
}
