//! Routes memory reads, writes and recall across tiers L0 to L4.
//!
//! L2 is the only tier whose failure is surfaced (`StorageUnavailable`); every
//! other tier degrades to the next one with a warning and a `tier_degraded`
//! event. Moving an item between tiers happens under a per-item lock that is
//! held only for the migration window, and every write bumps a per-item
//! revision so late mirror writes and stale cache copies are ignored.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::adapter::{
    ArchiveAdapter, CacheAdapter, DurableAdapter, LocalAdapter, StorageAdapter, VectorAdapter,
};
use super::archive::InMemoryArchive;
use super::durable_store::InMemoryDurableStore;
use super::fast_cache::InMemoryFastCache;
use super::vector_store::{VectorStore, VectorStoreConfig};
use super::{MemoryItem, Tier, TierPolicy};
use crate::error::{PlatformError, PlatformResult, StorageError};
use crate::events::{EventPublisher, EventType};

const TIERS: [Tier; 5] = [Tier::L0, Tier::L1, Tier::L2, Tier::L3, Tier::L4];

/// One adapter per tier.
pub struct TierSet {
    pub l0: Arc<dyn StorageAdapter>,
    pub l1: Arc<dyn StorageAdapter>,
    pub l2: Arc<dyn StorageAdapter>,
    pub l3: Arc<dyn StorageAdapter>,
    pub l4: Arc<dyn StorageAdapter>,
}

impl TierSet {
    /// Every tier backed by process memory.
    pub fn in_memory(policy: &TierPolicy) -> Self {
        Self {
            l0: Arc::new(LocalAdapter::new(policy.l0_capacity)),
            l1: Arc::new(CacheAdapter::new(
                Arc::new(InMemoryFastCache::default()),
                policy.l1_ttl,
            )),
            l2: Arc::new(DurableAdapter::new(Arc::new(InMemoryDurableStore::new()))),
            l3: Arc::new(VectorAdapter::new(Arc::new(VectorStore::new(
                VectorStoreConfig::default(),
            )))),
            l4: Arc::new(ArchiveAdapter::new(Arc::new(InMemoryArchive::new()))),
        }
    }
}

/// A recall result and the tier its content was served from.
#[derive(Debug, Clone, Serialize)]
pub struct RecallHit {
    pub item: MemoryItem,
    pub score: f32,
    pub source: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub hits: BTreeMap<Tier, u64>,
    pub degraded: BTreeMap<Tier, u64>,
    pub misses: u64,
    pub promotions: u64,
    pub archived: u64,
    pub restored: u64,
}

#[derive(Default)]
struct Counters {
    hits: [AtomicU64; 5],
    degraded: [AtomicU64; 5],
    misses: AtomicU64,
    promotions: AtomicU64,
    archived: AtomicU64,
    restored: AtomicU64,
}

struct AccessRecord {
    window_start: Instant,
    hits: u32,
    last_access: DateTime<Utc>,
}

#[derive(Default)]
struct ItemLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds one item's migration lock; the map entry is dropped with the last holder.
struct ItemGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: String,
    locks: Arc<ItemLocks>,
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ItemLocks {
    async fn acquire(self: &Arc<Self>, id: &str) -> ItemGuard {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        ItemGuard {
            guard: Some(guard),
            id: id.to_string(),
            locks: self.clone(),
        }
    }
}

struct Shared {
    l0: Arc<dyn StorageAdapter>,
    l1: Arc<dyn StorageAdapter>,
    l2: Arc<dyn StorageAdapter>,
    l3: Arc<dyn StorageAdapter>,
    l4: Arc<dyn StorageAdapter>,
    policy: TierPolicy,
    locks: Arc<ItemLocks>,
    revisions: DashMap<String, u64>,
    next_revision: AtomicU64,
    access: DashMap<String, AccessRecord>,
    counters: Counters,
    events: EventPublisher,
}

fn unavailable(err: StorageError) -> PlatformError {
    PlatformError::StorageUnavailable(err.to_string())
}

impl Shared {
    fn adapter(&self, tier: Tier) -> &Arc<dyn StorageAdapter> {
        match tier {
            Tier::L0 => &self.l0,
            Tier::L1 => &self.l1,
            Tier::L2 => &self.l2,
            Tier::L3 => &self.l3,
            Tier::L4 => &self.l4,
        }
    }

    fn revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Cached copy matches the last write (or no write was seen by this process).
    fn is_fresh(&self, item: &MemoryItem) -> bool {
        self.revisions
            .get(&item.id)
            .map_or(true, |current| *current == item.revision)
    }

    /// Copy is exactly the last write this process made.
    fn is_current(&self, item: &MemoryItem) -> bool {
        self.revisions
            .get(&item.id)
            .map_or(false, |current| *current == item.revision)
    }

    fn hit(&self, tier: Tier) {
        self.counters.hits[tier.priority() as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn degrade(&self, tier: Tier, operation: &str, err: &StorageError) {
        if let StorageError::Invalid { .. } = err {
            warn!("{} {} skipped: {}", tier, operation, err);
            return;
        }
        warn!("{} {} degraded: {}", tier, operation, err);
        self.counters.degraded[tier.priority() as usize].fetch_add(1, Ordering::Relaxed);
        self.events.emit(
            EventType::TierDegraded,
            None,
            json!({ "tier": tier, "operation": operation, "reason": err.to_string() }),
        );
    }

    /// Counts an access and returns the hits within the current window.
    fn record_access(&self, id: &str) -> u32 {
        let now = Instant::now();
        let mut record = self
            .access
            .entry(id.to_string())
            .or_insert_with(|| AccessRecord {
                window_start: now,
                hits: 0,
                last_access: Utc::now(),
            });
        if now.duration_since(record.window_start) > self.policy.access_window {
            record.window_start = now;
            record.hits = 0;
        }
        record.hits += 1;
        record.last_access = Utc::now();
        record.hits
    }

    fn last_access(&self, id: &str) -> Option<DateTime<Utc>> {
        self.access.get(id).map(|record| record.last_access)
    }

    /// Forgets an item's revision once every copy is gone. If a cache tier
    /// could not be cleared, a fresh revision stays behind as a tombstone so
    /// the leftover copy never reads as fresh.
    fn retire(&self, id: &str, stale_cache: bool) {
        if stale_cache {
            let tombstone = self.revision();
            self.revisions.insert(id.to_string(), tombstone);
        } else {
            self.revisions.remove(id);
        }
    }

    /// Removes the cache and index copies of an item. Returns whether an L0
    /// or L1 copy may have been left behind.
    async fn clear_copies(&self, id: &str, tiers: &[Tier]) -> bool {
        let mut stale_cache = false;
        for tier in tiers {
            if let Err(e) = self.adapter(*tier).remove(id).await {
                self.degrade(*tier, "remove", &e);
                stale_cache |= matches!(tier, Tier::L0 | Tier::L1);
            }
        }
        stale_cache
    }

    /// Writes a copy into a non-authoritative tier unless a newer write superseded it.
    async fn mirror(self: Arc<Self>, mut item: MemoryItem, tier: Tier) {
        let _guard = self.locks.acquire(&item.id).await;
        if !self.is_current(&item) {
            debug!("Skipping {} mirror of {}: superseded", tier, item.id);
            return;
        }
        item.tier = tier;
        if let Err(e) = self.adapter(tier).write(&item).await {
            self.degrade(tier, "mirror", &e);
        }
    }

    /// Removes every copy of an item. Caller holds the item lock.
    async fn purge_locked(&self, id: &str) -> PlatformResult<()> {
        let stale_cache = self
            .clear_copies(id, &[Tier::L0, Tier::L1, Tier::L3, Tier::L4])
            .await;
        self.l2.remove(id).await.map_err(unavailable)?;
        self.retire(id, stale_cache);
        self.access.remove(id);
        Ok(())
    }
}

/// Memory router over the five tiers.
pub struct TierManager {
    shared: Arc<Shared>,
    background: TaskTracker,
}

impl TierManager {
    pub fn new(tiers: TierSet, policy: TierPolicy, events: EventPublisher) -> Self {
        // Seeded from the clock so revisions keep increasing across restarts.
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        Self {
            shared: Arc::new(Shared {
                l0: tiers.l0,
                l1: tiers.l1,
                l2: tiers.l2,
                l3: tiers.l3,
                l4: tiers.l4,
                policy,
                locks: Arc::new(ItemLocks::default()),
                revisions: DashMap::new(),
                next_revision: AtomicU64::new(seed),
                access: DashMap::new(),
                counters: Counters::default(),
                events,
            }),
            background: TaskTracker::new(),
        }
    }

    fn spawn_mirror(&self, item: MemoryItem, tier: Tier) {
        let shared = self.shared.clone();
        self.background.spawn(shared.mirror(item, tier));
    }

    /// Stores an item durably in L2, then mirrors it into L1 and indexes it in L3.
    ///
    /// `explicit_tier` is a placement hint: `L0` also pins the item in the
    /// process-local tier, `L1` mirrors into the fast cache before returning,
    /// and `L4` sends the item straight to the cold archive.
    #[instrument(skip(self, item), fields(memory_id = %item.id))]
    pub async fn put(&self, mut item: MemoryItem, explicit_tier: Option<Tier>) -> PlatformResult<String> {
        let s = &self.shared;
        let id = item.id.clone();

        if explicit_tier == Some(Tier::L4) {
            if self.put_cold(item.clone()).await? {
                return Ok(id);
            }
        }

        let guard = s.locks.acquire(&id).await;
        item.tier = Tier::L2;
        item.revision = s.revision();
        s.l2.write(&item).await.map_err(unavailable)?;
        s.revisions.insert(id.clone(), item.revision);

        let pinned = explicit_tier == Some(Tier::L0);
        let cached_locally = matches!(s.l0.read(&id).await, Ok(Some(_)));
        if pinned || cached_locally {
            let mut local = item.clone();
            local.tier = Tier::L0;
            if let Err(e) = s.l0.write(&local).await {
                s.degrade(Tier::L0, "write", &e);
            }
        }
        drop(guard);

        if explicit_tier == Some(Tier::L1) {
            s.clone().mirror(item.clone(), Tier::L1).await;
        } else {
            self.spawn_mirror(item.clone(), Tier::L1);
        }
        if item.embedding.is_some() {
            self.spawn_mirror(item, Tier::L3);
        }

        debug!("Stored {} in L2", id);
        Ok(id)
    }

    /// Direct archival write. Returns false when L4 is unreachable so the
    /// caller falls back to the durable tier.
    async fn put_cold(&self, mut item: MemoryItem) -> PlatformResult<bool> {
        let s = &self.shared;
        let _guard = s.locks.acquire(&item.id).await;
        item.tier = Tier::L4;
        item.revision = s.revision();

        if let Err(e) = s.l4.write(&item).await {
            s.degrade(Tier::L4, "write", &e);
            return Ok(false);
        }
        let stale_cache = s
            .clear_copies(&item.id, &[Tier::L0, Tier::L1, Tier::L3])
            .await;
        s.l2.remove(&item.id).await.map_err(unavailable)?;
        s.retire(&item.id, stale_cache);
        Ok(true)
    }

    /// Reads through L0, L1 and L2; archived items are restored from L4.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> PlatformResult<MemoryItem> {
        let s = &self.shared;
        let now = Utc::now();

        match s.l0.read(id).await {
            Ok(Some(mut item)) if s.is_fresh(&item) => {
                if item.is_expired(now) {
                    return self.expire(id).await;
                }
                s.hit(Tier::L0);
                s.record_access(id);
                item.tier = Tier::L0;
                item.touch();
                return Ok(item);
            }
            Ok(_) => {}
            Err(e) => s.degrade(Tier::L0, "read", &e),
        }

        match s.l1.read(id).await {
            Ok(Some(mut item)) if s.is_fresh(&item) && !item.is_expired(now) => {
                s.hit(Tier::L1);
                if s.record_access(id) >= s.policy.l0_promotion_hits {
                    self.promote_to_l0(&item).await;
                }
                item.tier = Tier::L1;
                item.touch();
                return Ok(item);
            }
            Ok(_) => {}
            Err(e) => s.degrade(Tier::L1, "read", &e),
        }

        let guard = s.locks.acquire(id).await;
        let mut item = match s.l2.read(id).await.map_err(unavailable)? {
            Some(item) => item,
            None => match self.restore_locked(id).await? {
                Some(item) => item,
                None => {
                    s.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(PlatformError::NotFound(id.to_string()));
                }
            },
        };

        if item.is_expired(now) {
            s.purge_locked(id).await?;
            return Err(PlatformError::NotFound(id.to_string()));
        }

        s.hit(Tier::L2);
        // Under the item lock the L2 copy is authoritative; this also clears a tombstone.
        s.revisions.insert(id.to_string(), item.revision);
        if s.record_access(id) >= s.policy.l0_promotion_hits {
            let mut local = item.clone();
            local.tier = Tier::L0;
            if let Err(e) = s.l0.write(&local).await {
                s.degrade(Tier::L0, "promote", &e);
            } else {
                s.counters.promotions.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(guard);

        self.spawn_mirror(item.clone(), Tier::L1);
        item.touch();
        Ok(item)
    }

    async fn promote_to_l0(&self, item: &MemoryItem) {
        let s = &self.shared;
        let _guard = s.locks.acquire(&item.id).await;
        if !s.is_current(item) {
            return;
        }
        let mut local = item.clone();
        local.tier = Tier::L0;
        match s.l0.write(&local).await {
            Ok(()) => {
                s.counters.promotions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => s.degrade(Tier::L0, "promote", &e),
        }
    }

    async fn expire(&self, id: &str) -> PlatformResult<MemoryItem> {
        let _guard = self.shared.locks.acquire(id).await;
        self.shared.purge_locked(id).await?;
        Err(PlatformError::NotFound(id.to_string()))
    }

    /// Brings an archived item back into L2. Caller holds the item lock.
    async fn restore_locked(&self, id: &str) -> PlatformResult<Option<MemoryItem>> {
        let s = &self.shared;
        let mut item = match s.l4.read(id).await {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(None),
            Err(e) => {
                s.degrade(Tier::L4, "read", &e);
                return Ok(None);
            }
        };

        item.tier = Tier::L2;
        item.revision = s.revision();
        item.touch();
        s.l2.write(&item).await.map_err(unavailable)?;
        s.revisions.insert(id.to_string(), item.revision);

        if let Err(e) = s.l4.remove(id).await {
            s.degrade(Tier::L4, "remove", &e);
        }
        if item.embedding.is_some() {
            self.spawn_mirror(item.clone(), Tier::L3);
        }

        s.counters.restored.fetch_add(1, Ordering::Relaxed);
        s.events
            .emit(EventType::MemoryRestored, None, json!({ "memory_id": id }));
        info!("Restored {} from the cold archive", id);
        Ok(Some(item))
    }

    /// Similarity search over L3 merged with the process-local tier.
    ///
    /// Each candidate is served from the fastest tier holding a fresh copy;
    /// equal scores rank the faster tier first.
    #[instrument(skip(self, embedding))]
    pub async fn recall(&self, embedding: &[f32], top_k: usize) -> PlatformResult<Vec<RecallHit>> {
        let s = &self.shared;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: HashMap<String, f32> = HashMap::new();
        for tier in [Tier::L3, Tier::L0] {
            match s.adapter(tier).similar(embedding, top_k).await {
                Ok(ranked) => {
                    for (id, score) in ranked {
                        let best = candidates.entry(id).or_insert(score);
                        *best = best.max(score);
                    }
                }
                Err(e @ StorageError::Invalid { .. }) => {
                    return Err(PlatformError::InvalidInput(e.to_string()))
                }
                Err(e) => s.degrade(tier, "recall", &e),
            }
        }

        let now = Utc::now();
        let mut hits = Vec::with_capacity(candidates.len());
        for (id, score) in candidates {
            if let Some((item, source)) = self.resolve(&id).await {
                if !item.is_expired(now) {
                    hits.push(RecallHit { item, score, source });
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.source.priority().cmp(&b.source.priority()))
        });
        hits.truncate(top_k);

        for hit in &hits {
            s.record_access(&hit.item.id);
        }
        Ok(hits)
    }

    /// Fastest fresh copy of an item for recall. Soft on every tier.
    async fn resolve(&self, id: &str) -> Option<(MemoryItem, Tier)> {
        let s = &self.shared;
        for tier in [Tier::L0, Tier::L1] {
            match s.adapter(tier).read(id).await {
                Ok(Some(mut item)) if s.is_fresh(&item) => {
                    item.tier = tier;
                    return Some((item, tier));
                }
                Ok(_) => {}
                Err(e) => s.degrade(tier, "read", &e),
            }
        }
        match s.l2.read(id).await {
            Ok(found) => found.map(|mut item| {
                item.tier = Tier::L2;
                (item, Tier::L2)
            }),
            Err(e) => {
                s.degrade(Tier::L2, "recall", &e);
                match s.l3.read(id).await {
                    Ok(found) => found.map(|mut item| {
                        item.tier = Tier::L3;
                        (item, Tier::L3)
                    }),
                    Err(e) => {
                        s.degrade(Tier::L3, "read", &e);
                        None
                    }
                }
            }
        }
    }

    /// Moves an item to L4 once it has been inactive for `archive_after`.
    ///
    /// Returns whether the item moved. An unreachable archive leaves the item
    /// in L2 and returns `false`.
    #[instrument(skip(self))]
    pub async fn archive(&self, id: &str) -> PlatformResult<bool> {
        self.archive_inner(id, false).await
    }

    /// Archives regardless of recent activity.
    pub async fn force_archive(&self, id: &str) -> PlatformResult<bool> {
        self.archive_inner(id, true).await
    }

    async fn archive_inner(&self, id: &str, force: bool) -> PlatformResult<bool> {
        let s = &self.shared;
        let _guard = s.locks.acquire(id).await;

        let Some(item) = s.l2.read(id).await.map_err(unavailable)? else {
            return match s.l4.read(id).await {
                Ok(Some(_)) => Ok(false),
                Ok(None) => Err(PlatformError::NotFound(id.to_string())),
                Err(e) => {
                    s.degrade(Tier::L4, "read", &e);
                    Err(PlatformError::NotFound(id.to_string()))
                }
            };
        };

        let last_active = s
            .last_access(id)
            .map_or(item.last_accessed_at, |seen| seen.max(item.last_accessed_at));
        let idle = (Utc::now() - last_active).to_std().unwrap_or(Duration::ZERO);
        if !force && idle < s.policy.archive_after {
            return Ok(false);
        }

        let mut cold = item;
        cold.tier = Tier::L4;
        if let Err(e) = s.l4.write(&cold).await {
            s.degrade(Tier::L4, "archive", &e);
            return Ok(false);
        }
        let stale_cache = s.clear_copies(id, &[Tier::L0, Tier::L1, Tier::L3]).await;
        if let Err(e) = s.l2.remove(id).await {
            // Keep a single home: undo the archive copy.
            if let Err(rollback) = s.l4.remove(id).await {
                s.degrade(Tier::L4, "rollback", &rollback);
            }
            return Err(unavailable(e));
        }

        s.retire(id, stale_cache);
        s.access.remove(id);
        s.counters.archived.fetch_add(1, Ordering::Relaxed);
        s.events.emit(
            EventType::MemoryArchived,
            None,
            json!({ "memory_id": id, "idle_secs": idle.as_secs() }),
        );
        info!("Archived {} after {}s idle", id, idle.as_secs());
        Ok(true)
    }

    /// Sweeps L2: purges expired items and archives inactive ones.
    pub async fn archive_inactive(&self) -> PlatformResult<usize> {
        let items = self.shared.l2.scan().await.map_err(unavailable)?;
        let now = Utc::now();
        let mut archived = 0;

        for item in items {
            if item.is_expired(now) {
                let _guard = self.shared.locks.acquire(&item.id).await;
                self.shared.purge_locked(&item.id).await?;
                continue;
            }
            match self.archive(&item.id).await {
                Ok(true) => archived += 1,
                Ok(false) | Err(PlatformError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if archived > 0 {
            info!("Archive sweep moved {} items to L4", archived);
        }
        Ok(archived)
    }

    /// Removes an item from every tier.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> PlatformResult<()> {
        let s = &self.shared;
        let _guard = s.locks.acquire(id).await;

        let in_l2 = s.l2.read(id).await.map_err(unavailable)?.is_some();
        let in_l4 = match s.l4.read(id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                s.degrade(Tier::L4, "read", &e);
                false
            }
        };
        if !in_l2 && !in_l4 {
            return Err(PlatformError::NotFound(id.to_string()));
        }

        s.purge_locked(id).await
    }

    /// Waits for outstanding mirror and index writes.
    pub async fn flush(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    pub fn stats(&self) -> TierStats {
        let c = &self.shared.counters;
        let per_tier = |counters: &[AtomicU64; 5]| {
            TIERS
                .iter()
                .map(|tier| (*tier, counters[tier.priority() as usize].load(Ordering::Relaxed)))
                .collect::<BTreeMap<_, _>>()
        };
        TierStats {
            hits: per_tier(&c.hits),
            degraded: per_tier(&c.degraded),
            misses: c.misses.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            archived: c.archived.load(Ordering::Relaxed),
            restored: c.restored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HistorySink;
    use crate::memory::archive::ArchiveBackend;
    use crate::memory::durable_store::DurableBackend;
    use crate::memory::fast_cache::FastCacheBackend;

    struct Fixture {
        manager: TierManager,
        cache: Arc<InMemoryFastCache>,
        durable: Arc<InMemoryDurableStore>,
        archive: Arc<InMemoryArchive>,
        history: Arc<HistorySink>,
        events: EventPublisher,
    }

    fn fixture(policy: TierPolicy) -> Fixture {
        fixture_with_vectors(policy, VectorStoreConfig::default())
    }

    fn fixture_with_vectors(policy: TierPolicy, vectors: VectorStoreConfig) -> Fixture {
        let cache = Arc::new(InMemoryFastCache::new(64));
        let durable = Arc::new(InMemoryDurableStore::new());
        let archive = Arc::new(InMemoryArchive::new());
        let history = Arc::new(HistorySink::new(64));
        let events = EventPublisher::new(vec![history.clone()]);

        let tiers = TierSet {
            l0: Arc::new(LocalAdapter::new(policy.l0_capacity)),
            l1: Arc::new(CacheAdapter::new(cache.clone(), policy.l1_ttl)),
            l2: Arc::new(DurableAdapter::new(durable.clone())),
            l3: Arc::new(VectorAdapter::new(Arc::new(VectorStore::new(vectors)))),
            l4: Arc::new(ArchiveAdapter::new(archive.clone())),
        };
        Fixture {
            manager: TierManager::new(tiers, policy, events.clone()),
            cache,
            durable,
            archive,
            history,
            events,
        }
    }

    #[tokio::test]
    async fn test_put_is_durable_and_mirrored() {
        let f = fixture(TierPolicy::default());
        let id = f
            .manager
            .put(MemoryItem::text("hello tiers").with_id("m1"), None)
            .await
            .unwrap();
        assert_eq!(id, "m1");
        assert!(f.durable.get("m1").await.unwrap().is_some());

        f.manager.flush().await;
        assert!(f.cache.get("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_round_trip_and_promotion_to_l0() {
        let f = fixture(TierPolicy {
            l0_promotion_hits: 2,
            ..Default::default()
        });
        f.manager
            .put(MemoryItem::text("payload").with_id("m2"), None)
            .await
            .unwrap();
        f.manager.flush().await;

        let first = f.manager.get("m2").await.unwrap();
        assert_eq!(first.content.as_text(), Some("payload"));
        let _ = f.manager.get("m2").await.unwrap();
        let third = f.manager.get("m2").await.unwrap();
        assert_eq!(third.content, first.content);

        let stats = f.manager.stats();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.hits[&Tier::L0], 1);
    }

    #[tokio::test]
    async fn test_stale_cache_copy_is_ignored_after_update() {
        let f = fixture(TierPolicy::default());
        f.manager
            .put(MemoryItem::text("v1").with_id("m3"), None)
            .await
            .unwrap();
        f.manager.flush().await;

        // Simulate a lagging mirror: L1 still holds v1 while L2 has v2.
        let stale = f.cache.get("m3").await.unwrap().unwrap();
        f.manager
            .put(MemoryItem::text("v2").with_id("m3"), None)
            .await
            .unwrap();
        f.manager.flush().await;
        f.cache.set("m3", stale, Duration::from_secs(60)).await.unwrap();

        let item = f.manager.get("m3").await.unwrap();
        assert_eq!(item.content.as_text(), Some("v2"));
    }

    #[tokio::test]
    async fn test_expired_item_is_not_found_and_purged() {
        let f = fixture(TierPolicy::default());
        let mut item = MemoryItem::text("gone").with_id("m4");
        item.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        f.manager.put(item, None).await.unwrap();

        let err = f.manager.get("m4").await.unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
        assert!(f.durable.get("m4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_respects_inactivity_threshold() {
        let f = fixture(TierPolicy::default());
        f.manager
            .put(MemoryItem::text("recent").with_id("m5"), None)
            .await
            .unwrap();

        assert!(!f.manager.archive("m5").await.unwrap());
        assert!(f.durable.get("m5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archived_item_is_restored_on_read() {
        let f = fixture(TierPolicy {
            archive_after: Duration::ZERO,
            ..Default::default()
        });
        f.manager
            .put(MemoryItem::text("cold").with_id("m6"), None)
            .await
            .unwrap();
        f.manager.flush().await;

        assert!(f.manager.archive("m6").await.unwrap());
        assert!(f.archive.contains("m6"));
        assert!(f.durable.get("m6").await.unwrap().is_none());
        assert!(f.cache.get("m6").await.unwrap().is_none());

        let item = f.manager.get("m6").await.unwrap();
        assert_eq!(item.content.as_text(), Some("cold"));
        assert_eq!(item.tier, Tier::L2);
        assert!(!f.archive.contains("m6"));

        f.events.flush().await;
        assert_eq!(f.history.count(EventType::MemoryArchived), 1);
        assert_eq!(f.history.count(EventType::MemoryRestored), 1);
    }

    #[tokio::test]
    async fn test_explicit_cold_placement() {
        let f = fixture(TierPolicy::default());
        f.manager
            .put(MemoryItem::text("straight to archive").with_id("m7"), Some(Tier::L4))
            .await
            .unwrap();

        assert!(f.archive.get_blob("m7").await.unwrap().is_some());
        assert!(f.durable.get("m7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_every_copy() {
        let f = fixture(TierPolicy::default());
        f.manager
            .put(MemoryItem::text("bye").with_id("m8"), Some(Tier::L0))
            .await
            .unwrap();
        f.manager.flush().await;

        f.manager.delete("m8").await.unwrap();
        f.manager.flush().await;

        assert!(matches!(
            f.manager.get("m8").await,
            Err(PlatformError::NotFound(_))
        ));
        assert!(f.cache.get("m8").await.unwrap().is_none());
        assert!(matches!(
            f.manager.delete("m8").await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recall_ranks_and_prefers_faster_tier() {
        let f = fixture(TierPolicy::default());
        f.manager
            .put(
                MemoryItem::text("north").with_id("n").with_embedding(vec![1.0, 0.0]),
                Some(Tier::L0),
            )
            .await
            .unwrap();
        f.manager
            .put(
                MemoryItem::text("east").with_id("e").with_embedding(vec![0.0, 1.0]),
                None,
            )
            .await
            .unwrap();
        f.manager.flush().await;

        let hits = f.manager.recall(&[1.0, 0.2], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.id, "n");
        assert_eq!(hits[0].source, Tier::L0);
        assert!(hits[0].score > hits[1].score);

        assert!(f.manager.recall(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_archives_idle_items() {
        let f = fixture(TierPolicy {
            archive_after: Duration::ZERO,
            ..Default::default()
        });
        for i in 0..3 {
            f.manager
                .put(MemoryItem::text(format!("idle {i}")).with_id(format!("s{i}")), None)
                .await
                .unwrap();
        }

        assert_eq!(f.manager.archive_inactive().await.unwrap(), 3);
        assert!(f.durable.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_embedding_length_is_not_reported_as_an_outage() {
        let f = fixture_with_vectors(
            TierPolicy::default(),
            VectorStoreConfig {
                embedding_dim: 3,
                ..Default::default()
            },
        );
        f.manager
            .put(
                MemoryItem::text("short vector").with_id("v").with_embedding(vec![1.0, 0.0]),
                None,
            )
            .await
            .unwrap();
        f.manager.flush().await;

        assert_eq!(f.manager.get("v").await.unwrap().content.as_text(), Some("short vector"));
        assert_eq!(f.manager.stats().degraded[&Tier::L3], 0);
        assert_eq!(f.history.count(EventType::TierDegraded), 0);

        assert!(matches!(
            f.manager.recall(&[1.0, 0.0], 3).await,
            Err(PlatformError::InvalidInput(_))
        ));
        assert_eq!(f.manager.stats().degraded[&Tier::L3], 0);
    }
}
