//! Tensor catalog: lifecycle state machine over the chunk store.
//!
//! The catalog owns every tensor's descriptor and chunk table and drives the
//! `Pending -> Finalized -> Deleted` transitions. It:
//! - Accepts chunk appends from concurrent producers while a tensor is Pending
//! - Seals a tensor on finalize after checking element counts and checksums
//! - Serves reads of Finalized tensors only, optionally re-verifying them
//! - Tracks cache references so shared tensors are never reaped while in use
//!
//! Each tensor has its own lock. Appends and reads share it; finalize and
//! delete take it exclusively, so no reader ever sees a tensor mid-transition
//! and two finalizers never race. Operations on different tensors never
//! contend beyond the brief map lookup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::chunking::plan_chunks;
use crate::catalog::integrity::{Checksum, Verifier};
use crate::config::Config;
use crate::error::{Result, VaultError};
use crate::metrics::Metrics;
use crate::store::chunk_store::ChunkStore;
use crate::store::manifest::{Manifest, ManifestStore};
use crate::tensor::descriptor::{
    ChunkMeta, ModelId, Retention, TensorDescriptor, TensorId, TensorKind, TensorSpec,
    TensorState,
};

/// A finalized tensor as returned by [`TensorCatalog::read`].
#[derive(Debug, Clone)]
pub struct TensorData {
    pub descriptor: TensorDescriptor,
    /// Chunks in ascending index order.
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub meta: ChunkMeta,
    pub data: Bytes,
}

impl TensorData {
    /// Concatenate the chunk payloads into the tensor's full byte image.
    pub fn to_bytes(&self) -> Bytes {
        if let [only] = self.chunks.as_slice() {
            return only.data.clone();
        }
        let mut buf = BytesMut::with_capacity(self.descriptor.byte_size() as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.data);
        }
        buf.freeze()
    }

    pub fn element_count(&self) -> u64 {
        self.chunks.iter().map(|c| c.meta.element_count).sum()
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Recompute the checksum even when the catalog does not verify on read.
    pub verify: bool,
}

/// Filter for [`TensorCatalog::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TensorFilter {
    pub owner: Option<ModelId>,
    pub kind: Option<TensorKind>,
    pub state: Option<TensorState>,
}

impl TensorFilter {
    fn matches(&self, d: &TensorDescriptor) -> bool {
        self.owner.map_or(true, |o| d.owner == Some(o))
            && self.kind.map_or(true, |k| d.kind == k)
            && self.state.map_or(true, |s| d.state == s)
    }
}

/// Catalog-wide counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub pending: usize,
    pub finalized: usize,
    pub deleted: usize,
    pub finalized_bytes: u64,
    pub referenced: usize,
}

struct TensorRecord {
    descriptor: TensorDescriptor,
    /// Checksum supplied at create time, if any.
    expected_checksum: Option<Checksum>,
}

struct TensorSlot {
    record: RwLock<TensorRecord>,
    /// Chunk table. Appenders insert under the shared record lock, so it is
    /// stable whenever the record lock is held exclusively.
    chunks: Mutex<BTreeMap<u32, ChunkMeta>>,
    refs: AtomicUsize,
    created_at: Instant,
}

impl TensorSlot {
    fn new(descriptor: TensorDescriptor, expected_checksum: Option<Checksum>) -> Self {
        Self {
            record: RwLock::new(TensorRecord {
                descriptor,
                expected_checksum,
            }),
            chunks: Mutex::new(BTreeMap::new()),
            refs: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    fn chunk_table(&self) -> MutexGuard<'_, BTreeMap<u32, ChunkMeta>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The tensor catalog.
pub struct TensorCatalog {
    store: Arc<dyn ChunkStore>,

    /// Present for durable backends.
    manifests: Option<ManifestStore>,

    verifier: Verifier,

    slots: RwLock<HashMap<TensorId, Arc<TensorSlot>>>,

    verify_on_read: bool,

    max_chunk_bytes: usize,

    metrics: Arc<Metrics>,
}

impl TensorCatalog {
    pub fn new(store: Arc<dyn ChunkStore>, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            manifests: None,
            verifier: Verifier::new(),
            slots: RwLock::new(HashMap::new()),
            verify_on_read: config.catalog.verify_on_read,
            max_chunk_bytes: config.store.max_chunk_bytes,
            metrics,
        }
    }

    /// Persist finalized descriptors through `manifests`.
    pub fn with_manifests(mut self, manifests: ManifestStore) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Rebuild the catalog from persisted manifests and drop orphaned chunks.
    ///
    /// Returns `(restored, orphans_removed)`.
    pub async fn restore(&self) -> Result<(usize, usize)> {
        let Some(manifests) = &self.manifests else {
            return Ok((0, 0));
        };

        let mut restored = 0;
        {
            let mut slots = self.slots.write().await;
            for manifest in manifests.load_all().await? {
                let Manifest { descriptor, chunks } = manifest;
                if descriptor.state != TensorState::Finalized {
                    continue;
                }
                let id = descriptor.id;
                let slot = TensorSlot::new(descriptor, None);
                slot.chunk_table()
                    .extend(chunks.into_iter().map(|c| (c.index, c)));
                slots.insert(id, Arc::new(slot));
                restored += 1;
            }
        }

        let known: HashSet<TensorId> = self.slots.read().await.keys().copied().collect();
        let mut orphans = 0;
        for id in self.store.tensors().await? {
            if !known.contains(&id) {
                let removed = self.store.delete(id).await?;
                warn!(tensor_id = %id, chunks = removed, "Removed orphaned chunks");
                orphans += 1;
            }
        }

        info!(restored, orphans, "Catalog restored from manifests");
        Ok((restored, orphans))
    }

    async fn slot(&self, id: TensorId) -> Option<Arc<TensorSlot>> {
        self.slots.read().await.get(&id).cloned()
    }

    async fn require_slot(&self, id: TensorId) -> Result<Arc<TensorSlot>> {
        self.slot(id)
            .await
            .ok_or_else(|| VaultError::tensor_not_found(id))
    }

    /// Allocate a Pending tensor.
    pub async fn create(&self, spec: TensorSpec) -> Result<TensorId> {
        let total_elements = spec
            .element_count()
            .filter(|&n| {
                spec.dtype
                    .bytes_for(n)
                    .is_some_and(|bytes| usize::try_from(bytes).is_ok())
            })
            .ok_or_else(|| VaultError::InvalidShape {
                shape: spec.shape.clone(),
            })?;

        let id = TensorId::new();
        let descriptor = TensorDescriptor {
            id,
            name: spec.name,
            dtype: spec.dtype,
            shape: spec.shape,
            total_elements,
            storage_mode: spec.storage_mode,
            compression: spec.compression,
            checksum: None,
            state: TensorState::Pending,
            kind: spec.kind,
            owner: spec.owner,
            retention: spec.retention,
        };
        debug!(tensor_id = %id, name = %descriptor.name, dtype = %descriptor.dtype, total_elements, "Created pending tensor");

        let slot = TensorSlot::new(descriptor, spec.expected_checksum);
        self.slots.write().await.insert(id, Arc::new(slot));
        Ok(id)
    }

    /// Append one chunk to a Pending tensor.
    pub async fn append_chunk(
        &self,
        id: TensorId,
        index: u32,
        data: impl Into<Bytes>,
        element_count: u64,
    ) -> Result<()> {
        self.append(id, index, data.into(), element_count, None).await
    }

    /// Append a chunk holding a slice of the leading dimension.
    pub async fn append_slice(
        &self,
        id: TensorId,
        index: u32,
        data: impl Into<Bytes>,
        slice_shape: Vec<usize>,
    ) -> Result<()> {
        let data = data.into();
        let Some(element_count) = slice_shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64))
        else {
            return Err(VaultError::ChunkMisaligned {
                tensor_id: id,
                index,
                len: data.len(),
                elements: u64::MAX,
                expected: u64::MAX,
            });
        };
        self.append(id, index, data, element_count, Some(slice_shape))
            .await
    }

    async fn append(
        &self,
        id: TensorId,
        index: u32,
        data: Bytes,
        element_count: u64,
        slice_shape: Option<Vec<usize>>,
    ) -> Result<()> {
        let slot = self.require_slot(id).await?;
        let record = slot.record.read().await;
        let descriptor = &record.descriptor;
        if descriptor.state != TensorState::Pending {
            return Err(VaultError::InvalidState {
                tensor_id: id,
                state: descriptor.state,
                op: "append_chunk",
            });
        }

        let expected = descriptor.dtype.bytes_for(element_count);
        if expected != Some(data.len() as u64) {
            return Err(VaultError::ChunkMisaligned {
                tensor_id: id,
                index,
                len: data.len(),
                elements: element_count,
                expected: expected.unwrap_or(u64::MAX),
            });
        }

        if slot.chunk_table().contains_key(&index) {
            return Err(VaultError::DuplicateChunk {
                tensor_id: id,
                index,
            });
        }

        let byte_len = data.len() as u64;
        // The store rejects a racing duplicate atomically.
        self.store.put(id, index, data, element_count).await?;
        slot.chunk_table().insert(
            index,
            ChunkMeta {
                index,
                element_count,
                byte_len,
                slice_shape,
            },
        );

        self.metrics.chunks_written.inc();
        self.metrics.chunk_bytes_written.inc_by(byte_len);
        debug!(tensor_id = %id, chunk = index, element_count, size = byte_len, "Appended chunk");
        Ok(())
    }

    /// Seal a Pending tensor.
    pub async fn finalize(&self, id: TensorId) -> Result<Checksum> {
        self.finalize_with(id, None).await
    }

    /// Seal a Pending tensor, additionally requiring `expected` to match.
    pub async fn finalize_with(&self, id: TensorId, expected: Option<Checksum>) -> Result<Checksum> {
        let slot = self.require_slot(id).await?;
        let mut record = slot.record.write().await;
        if record.descriptor.state != TensorState::Pending {
            return Err(VaultError::InvalidState {
                tensor_id: id,
                state: record.descriptor.state,
                op: "finalize",
            });
        }

        let chunks: Vec<ChunkMeta> = slot.chunk_table().values().cloned().collect();
        let total = record.descriptor.total_elements;

        // Elements reachable from index 0 without a gap.
        let mut contiguous = 0u64;
        let mut gap = false;
        for (pos, chunk) in chunks.iter().enumerate() {
            if chunk.index as usize != pos {
                gap = true;
                break;
            }
            contiguous = contiguous.saturating_add(chunk.element_count);
        }
        if gap || contiguous != total {
            warn!(tensor_id = %id, expected = total, actual = contiguous, chunks = chunks.len(), "Finalize rejected: incomplete tensor");
            return Err(VaultError::IncompleteTensor {
                tensor_id: id,
                expected: total,
                actual: contiguous,
            });
        }

        let mut builder = self.verifier.begin();
        for chunk in &chunks {
            let data = self.load_chunk(id, chunk).await?;
            builder.update(&data);
        }
        let checksum = builder.finish();

        for supplied in [record.expected_checksum, expected].into_iter().flatten() {
            if !supplied.ct_eq(&checksum) {
                warn!(tensor_id = %id, expected = %supplied, actual = %checksum, "Finalize rejected: checksum conflict");
                return Err(VaultError::ChecksumConflict {
                    tensor_id: id,
                    expected: supplied.to_hex(),
                    actual: checksum.to_hex(),
                });
            }
        }

        record.descriptor.checksum = Some(checksum);
        record.descriptor.state = TensorState::Finalized;

        if let Some(manifests) = &self.manifests {
            let manifest = Manifest {
                descriptor: record.descriptor.clone(),
                chunks,
            };
            if let Err(e) = manifests.save(&manifest).await {
                // Roll back so the tensor is not readable without a durable manifest.
                record.descriptor.checksum = None;
                record.descriptor.state = TensorState::Pending;
                return Err(e);
            }
        }

        self.metrics.tensors_finalized.inc();
        info!(
            tensor_id = %id,
            name = %record.descriptor.name,
            elements = total,
            bytes = record.descriptor.byte_size(),
            checksum = %checksum,
            "Tensor finalized"
        );
        Ok(checksum)
    }

    /// Read a Finalized tensor.
    pub async fn read(&self, id: TensorId) -> Result<TensorData> {
        self.read_with(id, ReadOptions::default()).await
    }

    pub async fn read_with(&self, id: TensorId, options: ReadOptions) -> Result<TensorData> {
        let slot = self.require_slot(id).await?;
        let record = slot.record.read().await;
        let descriptor = &record.descriptor;
        match descriptor.state {
            TensorState::Finalized => {}
            TensorState::Pending => return Err(VaultError::NotReady(id)),
            TensorState::Deleted => return Err(VaultError::tensor_not_found(id)),
        }

        let metas: Vec<ChunkMeta> = slot.chunk_table().values().cloned().collect();
        let last = metas.last().map(|m| m.index + 1).unwrap_or(0);
        let mut chunks = Vec::with_capacity(metas.len());
        for meta in metas {
            let data = self.load_chunk(id, &meta).await?;
            chunks.push(Chunk { meta, data });
        }

        if self.verify_on_read || options.verify {
            if let Some(expected) = descriptor.checksum {
                let data = || chunks.iter().map(|c| &c.data);
                if !self.verifier.matches(data(), &expected) {
                    let actual = self.verifier.compute_checksum(data());
                    return Err(self.corrupt(id, 0..last, &expected.to_hex(), actual.to_hex()));
                }
            }
        }

        Ok(TensorData {
            descriptor: descriptor.clone(),
            chunks,
        })
    }

    /// Read a Finalized tensor as one contiguous buffer.
    pub async fn read_bytes(&self, id: TensorId) -> Result<(TensorDescriptor, Bytes)> {
        let data = self.read(id).await?;
        let bytes = data.to_bytes();
        Ok((data.descriptor, bytes))
    }

    /// Fetch one chunk and check it against its catalog entry.
    async fn load_chunk(&self, id: TensorId, meta: &ChunkMeta) -> Result<Bytes> {
        let range = meta.index..meta.index + 1;
        let payload = match self.store.fetch(id, meta.index).await {
            Ok(payload) => payload,
            Err(VaultError::NotFound(_)) => {
                return Err(self.corrupt(id, range, "chunk present", "chunk missing".into()));
            }
            Err(VaultError::CorruptTensor {
                expected, actual, ..
            }) => return Err(self.corrupt(id, range, &expected, actual)),
            Err(e) => return Err(e),
        };
        if payload.element_count != meta.element_count {
            return Err(self.corrupt(
                id,
                range,
                &format!("{} elements", meta.element_count),
                format!("{} elements", payload.element_count),
            ));
        }
        if payload.data.len() as u64 != meta.byte_len {
            return Err(self.corrupt(
                id,
                range,
                &format!("{} bytes", meta.byte_len),
                format!("{} bytes", payload.data.len()),
            ));
        }
        Ok(payload.data)
    }

    fn corrupt(
        &self,
        id: TensorId,
        chunks: std::ops::Range<u32>,
        expected: &str,
        actual: String,
    ) -> VaultError {
        self.metrics.corrupt_reads.inc();
        error!(tensor_id = %id, chunks = ?chunks, expected, actual = %actual, "Corrupt tensor");
        VaultError::CorruptTensor {
            tensor_id: id,
            chunks,
            expected: expected.to_string(),
            actual,
        }
    }

    /// Recompute a Finalized tensor's checksum and compare it with the stored one.
    pub async fn verify(&self, id: TensorId) -> Result<bool> {
        let slot = self.require_slot(id).await?;
        let record = slot.record.read().await;
        let expected = match record.descriptor.state {
            TensorState::Finalized => record.descriptor.checksum,
            TensorState::Pending => return Err(VaultError::NotReady(id)),
            TensorState::Deleted => return Err(VaultError::tensor_not_found(id)),
        };
        let Some(expected) = expected else {
            return Ok(false);
        };

        let metas: Vec<ChunkMeta> = slot.chunk_table().values().cloned().collect();
        let mut builder = self.verifier.begin();
        for meta in &metas {
            match self.load_chunk(id, meta).await {
                Ok(data) => builder.update(&data),
                Err(VaultError::CorruptTensor { .. }) => {
                    error!(tensor_id = %id, chunk = meta.index, "Verification failed: chunk unreadable");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let actual = builder.finish();
        let ok = actual.ct_eq(&expected);
        if !ok {
            self.metrics.corrupt_reads.inc();
            error!(
                tensor_id = %id,
                chunks = ?(0..metas.len() as u32),
                expected = %expected,
                actual = %actual,
                "Verification failed: checksum mismatch"
            );
        }
        Ok(ok)
    }

    /// Delete a tensor and its chunks. Deleting twice, or deleting an unknown
    /// id, succeeds.
    pub async fn delete(&self, id: TensorId) -> Result<()> {
        let Some(slot) = self.slot(id).await else {
            debug!(tensor_id = %id, "Delete of unknown tensor ignored");
            return Ok(());
        };
        let mut record = slot.record.write().await;
        self.delete_locked(id, &slot, &mut record).await
    }

    async fn delete_locked(
        &self,
        id: TensorId,
        slot: &TensorSlot,
        record: &mut TensorRecord,
    ) -> Result<()> {
        if record.descriptor.state == TensorState::Deleted {
            return Ok(());
        }
        let previous = record.descriptor.state;

        if let Some(manifests) = &self.manifests {
            manifests.remove(id).await?;
        }
        let removed = self.store.delete(id).await?;
        slot.chunk_table().clear();
        record.descriptor.state = TensorState::Deleted;
        record.descriptor.checksum = None;

        let refs = slot.refs.load(Ordering::Acquire);
        if refs > 0 {
            warn!(tensor_id = %id, refs, "Deleted tensor still referenced by caches");
        }
        self.metrics.tensors_deleted.inc();
        info!(tensor_id = %id, from = ?previous, chunks = removed, "Tensor deleted");
        Ok(())
    }

    /// Descriptor of a known tensor in any state.
    pub async fn describe(&self, id: TensorId) -> Result<TensorDescriptor> {
        let slot = self.require_slot(id).await?;
        let record = slot.record.read().await;
        Ok(record.descriptor.clone())
    }

    /// Chunk table of a known tensor.
    pub async fn chunks(&self, id: TensorId) -> Result<Vec<ChunkMeta>> {
        let slot = self.require_slot(id).await?;
        let chunks = slot.chunk_table().values().cloned().collect();
        Ok(chunks)
    }

    /// Descriptors matching `filter`, ordered by name.
    pub async fn list(&self, filter: &TensorFilter) -> Vec<TensorDescriptor> {
        let slots: Vec<Arc<TensorSlot>> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let record = slot.record.read().await;
            if filter.matches(&record.descriptor) {
                out.push(record.descriptor.clone());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn stats(&self) -> CatalogStats {
        let slots: Vec<Arc<TensorSlot>> = self.slots.read().await.values().cloned().collect();
        let mut stats = CatalogStats::default();
        for slot in slots {
            let record = slot.record.read().await;
            match record.descriptor.state {
                TensorState::Pending => stats.pending += 1,
                TensorState::Finalized => {
                    stats.finalized += 1;
                    stats.finalized_bytes += record.descriptor.byte_size();
                }
                TensorState::Deleted => stats.deleted += 1,
            }
            if slot.refs.load(Ordering::Acquire) > 0 {
                stats.referenced += 1;
            }
        }
        stats
    }

    /// Store a whole buffer as a new Finalized tensor.
    ///
    /// The buffer is split on element boundaries into chunks of at most the
    /// configured chunk size and the chunks are uploaded concurrently. On any
    /// failure the pending tensor is deleted.
    pub async fn write_tensor(&self, spec: TensorSpec, data: impl Into<Bytes>) -> Result<TensorId> {
        let data = data.into();
        let dtype = spec.dtype;
        let shape = spec.shape.clone();
        let id = self.create(spec).await?;
        let total = self.describe(id).await?.total_elements;

        let result = async {
            let expected = dtype
                .bytes_for(total)
                .ok_or_else(|| VaultError::InvalidShape {
                    shape: shape.clone(),
                })?;
            if data.len() as u64 != expected {
                return Err(VaultError::IncompleteTensor {
                    tensor_id: id,
                    expected: total,
                    actual: data.len() as u64 / dtype.byte_width() as u64,
                });
            }

            let plans = plan_chunks(dtype, &shape, data.len(), self.max_chunk_bytes);
            try_join_all(plans.into_iter().map(|plan| {
                let payload = data.slice(plan.bytes.clone());
                self.append(id, plan.index, payload, plan.element_count, plan.slice_shape)
            }))
            .await?;
            self.finalize(id).await
        }
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) => {
                if let Err(cleanup) = self.delete(id).await {
                    warn!(tensor_id = %id, error = %cleanup, "Failed to discard aborted tensor");
                }
                Err(e)
            }
        }
    }

    /// Take a cache reference on a Finalized tensor.
    pub async fn retain(&self, id: TensorId) -> Result<usize> {
        let slot = self.require_slot(id).await?;
        let record = slot.record.read().await;
        match record.descriptor.state {
            TensorState::Finalized => Ok(slot.refs.fetch_add(1, Ordering::AcqRel) + 1),
            TensorState::Pending => Err(VaultError::NotReady(id)),
            TensorState::Deleted => Err(VaultError::tensor_not_found(id)),
        }
    }

    /// Drop a cache reference. Returns the remaining count.
    pub async fn release(&self, id: TensorId) -> usize {
        let Some(slot) = self.slot(id).await else {
            return 0;
        };
        let previous = slot
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Current reference count (0 for unknown ids).
    pub async fn references(&self, id: TensorId) -> usize {
        match self.slot(id).await {
            Some(slot) => slot.refs.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Drop a reference and delete the tensor if it was cache-owned and is
    /// now unreferenced. Returns whether the tensor was deleted.
    pub async fn release_and_reap(&self, id: TensorId) -> Result<bool> {
        if self.release(id).await > 0 {
            return Ok(false);
        }
        self.try_reap(id).await
    }

    async fn try_reap(&self, id: TensorId) -> Result<bool> {
        let Some(slot) = self.slot(id).await else {
            return Ok(false);
        };
        let mut record = slot.record.write().await;
        let reapable = record.descriptor.state == TensorState::Finalized
            && record.descriptor.retention == Retention::Cached
            && slot.refs.load(Ordering::Acquire) == 0;
        if !reapable {
            return Ok(false);
        }
        self.delete_locked(id, &slot, &mut record).await?;
        debug!(tensor_id = %id, "Reaped unreferenced tensor");
        Ok(true)
    }

    /// Delete every Finalized cache-owned tensor with no references left.
    pub async fn reap_unreferenced(&self) -> Result<usize> {
        let ids: Vec<TensorId> = self.slots.read().await.keys().copied().collect();
        let mut reaped = 0;
        for id in ids {
            if self.try_reap(id).await? {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped, "Reaped unreferenced cached tensors");
        }
        Ok(reaped)
    }

    /// Delete Pending tensors older than `max_age` and forget deleted ones.
    ///
    /// Returns the number of abandoned Pending tensors removed.
    pub async fn sweep_stale_pending(&self, max_age: Duration) -> Result<usize> {
        let slots: Vec<(TensorId, Arc<TensorSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut swept = 0;
        let mut tombstones = Vec::new();
        for (id, slot) in slots {
            // Skip tensors mid-transition; the next sweep sees them.
            let Ok(mut record) = slot.record.try_write() else {
                continue;
            };
            match record.descriptor.state {
                TensorState::Pending if slot.created_at.elapsed() > max_age => {
                    self.delete_locked(id, &slot, &mut record).await?;
                    tombstones.push(id);
                    swept += 1;
                }
                TensorState::Deleted if slot.refs.load(Ordering::Acquire) == 0 => {
                    tombstones.push(id);
                }
                _ => {}
            }
        }

        if !tombstones.is_empty() {
            let mut map = self.slots.write().await;
            for id in &tombstones {
                map.remove(id);
            }
        }
        if swept > 0 {
            info!(swept, max_age_secs = max_age.as_secs(), "Swept stale pending tensors");
        }
        Ok(swept)
    }

    /// Drop every in-memory index structure. Durable chunk data and
    /// manifests are left untouched.
    pub async fn clear_index(&self) {
        let mut slots = self.slots.write().await;
        let n = slots.len();
        slots.clear();
        debug!(entries = n, "Cleared catalog index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::chunk_store::MemoryChunkStore;
    use crate::tensor::dtype::{encode, DType};

    fn catalog() -> TensorCatalog {
        let mut config = Config::default();
        config.store.max_chunk_bytes = 64;
        TensorCatalog::new(
            Arc::new(MemoryChunkStore::new()),
            &config,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_zero_dimension() {
        let catalog = catalog();
        let err = catalog
            .create(TensorSpec::new("bad", DType::F32, vec![3, 0]))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidShape { .. }));
    }

    #[tokio::test]
    async fn test_append_rejects_misaligned_chunk() {
        let catalog = catalog();
        let id = catalog
            .create(TensorSpec::new("w", DType::F32, vec![4]))
            .await
            .unwrap();
        // 7 bytes cannot hold 2 f32 elements.
        let err = catalog.append_chunk(id, 0, vec![0u8; 7], 2).await.unwrap_err();
        assert!(matches!(err, VaultError::ChunkMisaligned { len: 7, expected: 8, .. }));
    }

    #[tokio::test]
    async fn test_gap_in_chunk_indices_is_incomplete() {
        let catalog = catalog();
        let id = catalog
            .create(TensorSpec::new("w", DType::F32, vec![4]))
            .await
            .unwrap();
        catalog.append_chunk(id, 0, vec![0u8; 8], 2).await.unwrap();
        catalog.append_chunk(id, 2, vec![0u8; 8], 2).await.unwrap();

        let err = catalog.finalize(id).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::IncompleteTensor { expected: 4, actual: 2, .. }
        ));
        assert_eq!(
            catalog.describe(id).await.unwrap().state,
            TensorState::Pending
        );
    }

    #[tokio::test]
    async fn test_finalize_twice_is_invalid_state() {
        let catalog = catalog();
        let id = catalog
            .write_tensor(TensorSpec::new("w", DType::U8, vec![3]), vec![1u8, 2, 3])
            .await
            .unwrap();
        let err = catalog.finalize(id).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::InvalidState { state: TensorState::Finalized, .. }
        ));
    }

    #[tokio::test]
    async fn test_expected_checksum_enforced() {
        let catalog = catalog();
        let payload = encode(&[1.0f32, 2.0]);

        let good = catalog
            .create(
                TensorSpec::new("ok", DType::F32, vec![2]).expect_checksum(Checksum::of(&payload)),
            )
            .await
            .unwrap();
        catalog.append_chunk(good, 0, payload.clone(), 2).await.unwrap();
        assert_eq!(catalog.finalize(good).await.unwrap(), Checksum::of(&payload));

        let bad = catalog
            .create(TensorSpec::new("bad", DType::F32, vec![2]).expect_checksum(Checksum::of(b"x")))
            .await
            .unwrap();
        catalog.append_chunk(bad, 0, payload, 2).await.unwrap();
        let err = catalog.finalize(bad).await.unwrap_err();
        assert!(matches!(err, VaultError::ChecksumConflict { .. }));
        assert_eq!(
            catalog.describe(bad).await.unwrap().state,
            TensorState::Pending
        );
    }

    #[tokio::test]
    async fn test_write_tensor_chunks_on_rows() {
        let catalog = catalog();
        // 8 rows of 4 f32 = 16 bytes per row; 64-byte budget fits 4 rows.
        let values: Vec<f32> = (0..32).map(|v| v as f32).collect();
        let id = catalog
            .write_tensor(TensorSpec::new("rows", DType::F32, vec![8, 4]), encode(&values))
            .await
            .unwrap();

        let chunks = catalog.chunks(id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].slice_shape, Some(vec![4, 4]));

        let (desc, bytes) = catalog.read_bytes(id).await.unwrap();
        assert_eq!(desc.total_elements, 32);
        assert_eq!(bytes, Bytes::from(encode(&values)));
    }

    #[tokio::test]
    async fn test_write_tensor_wrong_length_discards_pending() {
        let catalog = catalog();
        let err = catalog
            .write_tensor(TensorSpec::new("short", DType::F32, vec![4]), vec![0u8; 12])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::IncompleteTensor { expected: 4, actual: 3, .. }
        ));
        assert_eq!(catalog.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn test_references_and_reaping() {
        let catalog = catalog();
        let spec = TensorSpec::new("act", DType::U8, vec![2]).retention(Retention::Cached);
        let id = catalog.write_tensor(spec, vec![9u8, 9]).await.unwrap();
        let root = catalog
            .write_tensor(TensorSpec::new("weight", DType::U8, vec![1]), vec![1u8])
            .await
            .unwrap();

        assert_eq!(catalog.retain(id).await.unwrap(), 1);
        assert_eq!(catalog.retain(id).await.unwrap(), 2);
        assert_eq!(catalog.reap_unreferenced().await.unwrap(), 0);

        assert!(!catalog.release_and_reap(id).await.unwrap());
        assert!(catalog.release_and_reap(id).await.unwrap());
        assert!(matches!(catalog.read(id).await, Err(VaultError::NotFound(_))));

        // Root tensors survive with no references.
        assert_eq!(catalog.reap_unreferenced().await.unwrap(), 0);
        assert!(catalog.read(root).await.is_ok());
    }

    #[tokio::test]
    async fn test_retain_requires_finalized() {
        let catalog = catalog();
        let id = catalog
            .create(TensorSpec::new("p", DType::U8, vec![1]))
            .await
            .unwrap();
        assert!(matches!(catalog.retain(id).await, Err(VaultError::NotReady(_))));
        assert!(matches!(
            catalog.retain(TensorId::new()).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stale_pending() {
        let catalog = catalog();
        let old = catalog
            .create(TensorSpec::new("old", DType::U8, vec![1]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = catalog
            .create(TensorSpec::new("fresh", DType::U8, vec![1]))
            .await
            .unwrap();

        let swept = catalog
            .sweep_stale_pending(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        // Swept tensors are forgotten entirely.
        assert!(matches!(catalog.describe(old).await, Err(VaultError::NotFound(_))));
        assert_eq!(
            catalog.describe(fresh).await.unwrap().state,
            TensorState::Pending
        );
    }

    #[tokio::test]
    async fn test_list_filters() {
        let catalog = catalog();
        let model = ModelId(uuid::Uuid::new_v4());
        catalog
            .write_tensor(
                TensorSpec::new("b", DType::U8, vec![1]).owner(model).kind(TensorKind::Bias),
                vec![0u8],
            )
            .await
            .unwrap();
        catalog
            .write_tensor(TensorSpec::new("a", DType::U8, vec![1]).owner(model), vec![0u8])
            .await
            .unwrap();
        catalog
            .create(TensorSpec::new("other", DType::U8, vec![1]))
            .await
            .unwrap();

        let owned = catalog
            .list(&TensorFilter {
                owner: Some(model),
                ..Default::default()
            })
            .await;
        let names: Vec<_> = owned.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let pending = catalog
            .list(&TensorFilter {
                state: Some(TensorState::Pending),
                ..Default::default()
            })
            .await;
        assert_eq!(pending.len(), 1);
    }
}
