//! Activation cache: (model, layer, input fingerprint) -> tensor.
//!
//! Bounded by entry count with least-recently-used eviction and optional
//! per-entry expiry. Recency is a logical access tick, so two accesses never
//! tie and never-touched entries age in insertion order.
//!
//! The cache only holds references. Evicting, expiring or replacing an entry
//! releases its reference on the catalog but never deletes the tensor;
//! unreferenced cache-owned tensors are removed by the catalog's reaper.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::catalog::tensor_catalog::TensorCatalog;
use crate::config::Config;
use crate::error::{Result, VaultError};
use crate::metrics::Metrics;
use crate::tensor::descriptor::{ModelId, TensorId};

/// Fixed-length hash of the cache-relevant part of an inference input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of raw input bytes (e.g. token ids or an encoded prompt).
    pub fn of(input: &[u8]) -> Self {
        Self(*blake3::hash(input).as_bytes())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = blake3::Hash::from(self.0).to_hex();
        write!(f, "Fingerprint({})", &hex[..16])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationKey {
    pub model: ModelId,
    pub layer: u32,
    pub input: Fingerprint,
}

impl ActivationKey {
    pub fn new(model: ModelId, layer: u32, input: Fingerprint) -> Self {
        Self {
            model,
            layer,
            input,
        }
    }
}

/// Snapshot of one entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub tensor: TensorId,
    pub hit_count: u64,
    pub last_accessed: Instant,
    pub expires_at: Option<Instant>,
    pub pinned: bool,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationStats {
    pub len: usize,
    pub capacity: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// How to insert an entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    /// Time to live; `None` falls back to the configured default.
    pub ttl: Option<Duration>,
    /// Exempt the entry from capacity eviction.
    pub pinned: bool,
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct Index {
    slots: HashMap<ActivationKey, Slot>,
    /// Unpinned entries by recency, least recent first.
    lru: BTreeMap<u64, ActivationKey>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Index {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &ActivationKey) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        if !slot.entry.pinned {
            self.lru.remove(&slot.tick);
        }
        Some(slot.entry)
    }

    fn touch(&mut self, key: &ActivationKey, now: Instant) -> Option<TensorId> {
        let tick = self.tick();
        let slot = self.slots.get_mut(key)?;
        slot.entry.hit_count += 1;
        slot.entry.last_accessed = now;
        let old = std::mem::replace(&mut slot.tick, tick);
        let tensor = slot.entry.tensor;
        if !slot.entry.pinned {
            self.lru.remove(&old);
            self.lru.insert(tick, *key);
        }
        Some(tensor)
    }

    fn pop_lru(&mut self) -> Option<(ActivationKey, CacheEntry)> {
        let (_, key) = self.lru.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.entry))
    }
}

/// Capacity- and TTL-bounded activation cache.
pub struct ActivationCache {
    catalog: Arc<TensorCatalog>,
    index: Mutex<Index>,
    capacity: usize,
    default_ttl: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl ActivationCache {
    pub fn new(catalog: Arc<TensorCatalog>, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::with_capacity(
            catalog,
            config.activation.capacity,
            config.default_activation_ttl(),
            metrics,
        )
    }

    pub fn with_capacity(
        catalog: Arc<TensorCatalog>,
        capacity: usize,
        default_ttl: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            catalog,
            index: Mutex::new(Index::default()),
            capacity: capacity.max(1),
            default_ttl,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a key. Expired entries count as misses and are dropped.
    pub async fn lookup(&self, key: &ActivationKey) -> Option<TensorId> {
        let now = Instant::now();
        let mut index = self.index.lock().await;

        let expired = match index.slots.get(key) {
            None => {
                index.misses += 1;
                drop(index);
                self.metrics.activation_misses.inc();
                return None;
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            let entry = index.remove(key);
            index.expirations += 1;
            index.misses += 1;
            let len = index.slots.len();
            drop(index);

            self.metrics.activation_expirations.inc();
            self.metrics.activation_misses.inc();
            self.metrics.activation_entries.set(len as i64);
            if let Some(entry) = entry {
                debug!(model = %key.model, layer = key.layer, tensor_id = %entry.tensor, "Activation entry expired");
                self.catalog.release(entry.tensor).await;
            }
            return None;
        }

        let tensor = index.touch(key, now);
        index.hits += 1;
        drop(index);
        self.metrics.activation_hits.inc();
        tensor
    }

    /// Entry bookkeeping without counting as an access.
    pub async fn peek(&self, key: &ActivationKey) -> Option<CacheEntry> {
        self.index.lock().await.slots.get(key).map(|s| s.entry)
    }

    /// Insert or replace an entry. `ttl` of `None` uses the default TTL.
    pub async fn insert(
        &self,
        key: ActivationKey,
        tensor: TensorId,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.insert_with(
            key,
            tensor,
            InsertOptions {
                ttl,
                pinned: false,
            },
        )
        .await
    }

    /// Insert with explicit options.
    ///
    /// The tensor must be Finalized. A later insert for the same key replaces
    /// the earlier one and releases its tensor.
    pub async fn insert_with(
        &self,
        key: ActivationKey,
        tensor: TensorId,
        options: InsertOptions,
    ) -> Result<()> {
        self.catalog.retain(tensor).await?;

        let now = Instant::now();
        let ttl = options.ttl.or(self.default_ttl);
        let mut released = Vec::new();
        let mut evicted = 0u64;
        let mut expired = 0u64;

        let mut index = self.index.lock().await;
        if let Some(old) = index.remove(&key) {
            released.push(old.tensor);
        } else if index.slots.len() >= self.capacity {
            // Expired entries go before any live one is evicted.
            let stale: Vec<ActivationKey> = index
                .slots
                .iter()
                .filter(|(_, slot)| slot.entry.is_expired(now))
                .map(|(k, _)| *k)
                .collect();
            for k in &stale {
                if let Some(entry) = index.remove(k) {
                    expired += 1;
                    released.push(entry.tensor);
                }
            }
            index.expirations += expired;
        }

        if index.slots.len() >= self.capacity {
            match index.pop_lru() {
                Some((victim, entry)) => {
                    index.evictions += 1;
                    evicted += 1;
                    released.push(entry.tensor);
                    debug!(
                        model = %victim.model,
                        layer = victim.layer,
                        tensor_id = %entry.tensor,
                        hits = entry.hit_count,
                        "Evicted activation entry"
                    );
                }
                None => {
                    drop(index);
                    self.catalog.release(tensor).await;
                    return Err(VaultError::CacheFull(self.capacity));
                }
            }
        }

        let tick = index.tick();
        index.slots.insert(
            key,
            Slot {
                entry: CacheEntry {
                    tensor,
                    hit_count: 0,
                    last_accessed: now,
                    expires_at: ttl.map(|t| now + t),
                    pinned: options.pinned,
                },
                tick,
            },
        );
        if !options.pinned {
            index.lru.insert(tick, key);
        }
        let len = index.slots.len();
        drop(index);

        self.metrics.activation_evictions.inc_by(evicted);
        self.metrics.activation_expirations.inc_by(expired);
        self.metrics.activation_entries.set(len as i64);
        for old in released {
            self.catalog.release(old).await;
        }
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn invalidate(&self, key: &ActivationKey) -> bool {
        let mut index = self.index.lock().await;
        let removed = index.remove(key);
        let len = index.slots.len();
        drop(index);

        self.metrics.activation_entries.set(len as i64);
        match removed {
            Some(entry) => {
                self.catalog.release(entry.tensor).await;
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut index = self.index.lock().await;
        let expired: Vec<ActivationKey> = index
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        let tensors: Vec<TensorId> = expired
            .iter()
            .filter_map(|key| index.remove(key))
            .map(|entry| entry.tensor)
            .collect();
        index.expirations += tensors.len() as u64;
        let len = index.slots.len();
        drop(index);

        self.metrics.activation_expirations.inc_by(tensors.len() as u64);
        self.metrics.activation_entries.set(len as i64);
        for tensor in &tensors {
            self.catalog.release(*tensor).await;
        }
        if !tensors.is_empty() {
            info!(expired = tensors.len(), remaining = len, "Activation expiry sweep");
        }
        tensors.len()
    }

    /// Exempt an entry from eviction. Returns whether the key exists.
    pub async fn pin(&self, key: &ActivationKey) -> bool {
        let mut index = self.index.lock().await;
        let Some(slot) = index.slots.get_mut(key) else {
            return false;
        };
        if !slot.entry.pinned {
            slot.entry.pinned = true;
            let tick = slot.tick;
            index.lru.remove(&tick);
        }
        true
    }

    /// Make a pinned entry evictable again, as most recently used.
    pub async fn unpin(&self, key: &ActivationKey) -> bool {
        let mut index = self.index.lock().await;
        let tick = index.tick();
        let Some(slot) = index.slots.get_mut(key) else {
            return false;
        };
        if slot.entry.pinned {
            slot.entry.pinned = false;
            slot.tick = tick;
            index.lru.insert(tick, *key);
        }
        true
    }

    /// Return the cached tensor for `key`, or compute, store and cache it.
    ///
    /// `compute` must return a Finalized tensor. Concurrent misses on the
    /// same key may both compute; the later insert wins.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: ActivationKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<TensorId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TensorId>>,
    {
        if let Some(tensor) = self.lookup(&key).await {
            return Ok(tensor);
        }
        let tensor = compute().await?;
        self.insert(key, tensor, ttl).await?;
        Ok(tensor)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> ActivationStats {
        let index = self.index.lock().await;
        ActivationStats {
            len: index.slots.len(),
            capacity: self.capacity,
            pinned: index.slots.len() - index.lru.len(),
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
            expirations: index.expirations,
        }
    }

    /// Drop every entry and release all references.
    pub async fn clear(&self) {
        let mut index = self.index.lock().await;
        let tensors: Vec<TensorId> = index.slots.drain().map(|(_, s)| s.entry.tensor).collect();
        index.lru.clear();
        drop(index);

        self.metrics.activation_entries.set(0);
        for tensor in tensors {
            self.catalog.release(tensor).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::chunk_store::MemoryChunkStore;
    use crate::tensor::descriptor::{Retention, TensorSpec};
    use crate::tensor::dtype::DType;
    use uuid::Uuid;

    fn setup(capacity: usize) -> (Arc<TensorCatalog>, ActivationCache) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let catalog = Arc::new(TensorCatalog::new(
            Arc::new(MemoryChunkStore::new()),
            &Config::default(),
            metrics.clone(),
        ));
        let cache = ActivationCache::with_capacity(catalog.clone(), capacity, None, metrics);
        (catalog, cache)
    }

    async fn tensor(catalog: &TensorCatalog) -> TensorId {
        let spec = TensorSpec::new("act", DType::U8, vec![4]).retention(Retention::Cached);
        catalog.write_tensor(spec, vec![1u8, 2, 3, 4]).await.unwrap()
    }

    fn key(n: u8) -> ActivationKey {
        ActivationKey::new(ModelId(Uuid::nil()), 0, Fingerprint::of(&[n]))
    }

    #[tokio::test]
    async fn test_hit_updates_bookkeeping() {
        let (catalog, cache) = setup(4);
        let t = tensor(&catalog).await;
        cache.insert(key(1), t, None).await.unwrap();

        assert_eq!(cache.lookup(&key(1)).await, Some(t));
        assert_eq!(cache.lookup(&key(1)).await, Some(t));
        assert_eq!(cache.lookup(&key(2)).await, None);

        let entry = cache.peek(&key(1)).await.unwrap();
        assert_eq!(entry.hit_count, 2);
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (2, 1));
        assert_eq!(catalog.references(t).await, 1);
    }

    #[tokio::test]
    async fn test_insert_requires_finalized_tensor() {
        let (catalog, cache) = setup(4);
        let pending = catalog
            .create(TensorSpec::new("p", DType::U8, vec![1]))
            .await
            .unwrap();
        let err = cache.insert(key(1), pending, None).await.unwrap_err();
        assert!(matches!(err, VaultError::NotReady(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_replace_releases_previous_tensor() {
        let (catalog, cache) = setup(4);
        let first = tensor(&catalog).await;
        let second = tensor(&catalog).await;

        cache.insert(key(1), first, None).await.unwrap();
        cache.insert(key(1), second, None).await.unwrap();

        assert_eq!(cache.lookup(&key(1)).await, Some(second));
        assert_eq!(cache.len().await, 1);
        assert_eq!(catalog.references(first).await, 0);
        // Replacement does not delete; the reaper does.
        assert!(catalog.read(first).await.is_ok());
        assert_eq!(catalog.reap_unreferenced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_eviction() {
        let (catalog, cache) = setup(2);
        let t = tensor(&catalog).await;

        cache
            .insert_with(key(1), t, InsertOptions { ttl: None, pinned: true })
            .await
            .unwrap();
        cache.insert(key(2), t, None).await.unwrap();
        cache.insert(key(3), t, None).await.unwrap();

        assert!(cache.peek(&key(1)).await.is_some());
        assert!(cache.peek(&key(2)).await.is_none());
        assert!(cache.peek(&key(3)).await.is_some());

        assert!(cache.pin(&key(3)).await);
        let err = cache.insert(key(4), t, None).await.unwrap_err();
        assert!(matches!(err, VaultError::CacheFull(2)));
        // The failed insert gave its reference back.
        assert_eq!(catalog.references(t).await, 2);

        assert!(cache.unpin(&key(1)).await);
        cache.insert(key(4), t, None).await.unwrap();
        assert!(cache.peek(&key(1)).await.is_none());
        assert_eq!(cache.stats().await.pinned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_lookup() {
        let (catalog, cache) = setup(4);
        let t = tensor(&catalog).await;
        cache
            .insert(key(1), t, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.lookup(&key(1)).await, Some(t));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.lookup(&key(1)).await, None);
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await.expirations, 1);
        assert_eq!(catalog.references(t).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_drops_expired_before_evicting() {
        let (catalog, cache) = setup(2);
        let t = tensor(&catalog).await;
        cache.insert(key(1), t, None).await.unwrap();
        cache.insert(key(2), t, Some(Duration::from_secs(1))).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.insert(key(3), t, None).await.unwrap();

        // key(1) is the least recently used but still live.
        assert!(cache.peek(&key(1)).await.is_some());
        assert!(cache.peek(&key(2)).await.is_none());
        assert!(cache.peek(&key(3)).await.is_some());
        let stats = cache.stats().await;
        assert_eq!((stats.expirations, stats.evictions), (1, 0));
        assert_eq!(catalog.references(t).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let (catalog, cache) = setup(8);
        let t = tensor(&catalog).await;
        cache.insert(key(1), t, Some(Duration::from_secs(1))).await.unwrap();
        cache.insert(key(2), t, Some(Duration::from_secs(100))).await.unwrap();
        cache.insert(key(3), t, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.len().await, 2);
        assert_eq!(catalog.references(t).await, 2);
    }

    #[tokio::test]
    async fn test_get_or_compute_only_computes_on_miss() {
        let (catalog, cache) = setup(4);
        let t = tensor(&catalog).await;

        let first = cache
            .get_or_compute(key(1), None, || async { Ok(t) })
            .await
            .unwrap();
        assert_eq!(first, t);

        let second = cache
            .get_or_compute(key(1), None, || async {
                Err(VaultError::InvalidConfig("cached value must be reused".into()))
            })
            .await
            .unwrap();
        assert_eq!(second, t);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let (catalog, cache) = setup(4);
        let t = tensor(&catalog).await;
        cache.insert(key(1), t, None).await.unwrap();
        cache.insert(key(2), t, None).await.unwrap();

        assert!(cache.invalidate(&key(1)).await);
        assert!(!cache.invalidate(&key(1)).await);
        assert_eq!(catalog.references(t).await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(catalog.references(t).await, 0);
    }
}
