//! Chunk store contract and the in-memory arena backend.
//!
//! A chunk store holds immutable byte payloads addressed by
//! `(tensor id, chunk index)`. It never interprets the bytes and never
//! decides chunk boundaries; it only guarantees write-once, addressable
//! storage per index.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, VaultError};
use crate::tensor::descriptor::TensorId;

/// Durable storage of immutable chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk. Fails with `DuplicateChunk` if the index is taken.
    async fn put(&self, tensor: TensorId, index: u32, data: Bytes, element_count: u64)
        -> Result<()>;

    /// Fetch a chunk with the element count it was written with.
    /// Fails with `NotFound` if absent.
    async fn fetch(&self, tensor: TensorId, index: u32) -> Result<ChunkPayload>;

    /// Fetch a chunk's bytes. Fails with `NotFound` if absent.
    async fn get(&self, tensor: TensorId, index: u32) -> Result<Bytes> {
        Ok(self.fetch(tensor, index).await?.data)
    }

    /// Remove every chunk of a tensor. Returns how many were removed.
    async fn delete(&self, tensor: TensorId) -> Result<usize>;

    /// Indices currently stored for a tensor, ascending.
    async fn indices(&self, tensor: TensorId) -> Result<Vec<u32>>;

    /// Tensors with at least one stored chunk.
    async fn tensors(&self) -> Result<Vec<TensorId>>;

    /// I/O counters.
    fn stats(&self) -> StoreStats;
}

/// Snapshot of chunk store I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub chunks_read: u64,
    pub bytes_read: u64,
}

/// Shared counter block used by the backends.
#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    chunks_read: AtomicU64,
    bytes_read: AtomicU64,
}

impl IoCounters {
    pub(crate) fn record_write(&self, bytes: usize) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StoreStats {
        StoreStats {
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// A stored chunk as read back from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub data: Bytes,
    /// Element count recorded when the chunk was written.
    pub element_count: u64,
}

/// Arena-style store keeping every chunk in process memory.
///
/// Suitable for tests and for caches whose tensors do not need to outlive
/// the process.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    arena: RwLock<HashMap<TensorId, BTreeMap<u32, ChunkPayload>>>,
    counters: IoCounters,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes resident in the arena.
    pub async fn resident_bytes(&self) -> usize {
        let arena = self.arena.read().await;
        arena
            .values()
            .flat_map(|chunks| chunks.values())
            .map(|c| c.data.len())
            .sum()
    }

    /// Total elements resident in the arena, as declared by the writers.
    pub async fn resident_elements(&self) -> u64 {
        let arena = self.arena.read().await;
        arena
            .values()
            .flat_map(|chunks| chunks.values())
            .map(|c| c.element_count)
            .sum()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(
        &self,
        tensor: TensorId,
        index: u32,
        data: Bytes,
        element_count: u64,
    ) -> Result<()> {
        let len = data.len();
        let mut arena = self.arena.write().await;
        let chunks = arena.entry(tensor).or_default();
        if chunks.contains_key(&index) {
            return Err(VaultError::DuplicateChunk {
                tensor_id: tensor,
                index,
            });
        }
        chunks.insert(
            index,
            ChunkPayload {
                data,
                element_count,
            },
        );
        drop(arena);

        self.counters.record_write(len);
        debug!(tensor_id = %tensor, chunk = index, size = len, "Stored chunk in memory");
        Ok(())
    }

    async fn fetch(&self, tensor: TensorId, index: u32) -> Result<ChunkPayload> {
        let arena = self.arena.read().await;
        let payload = arena
            .get(&tensor)
            .and_then(|chunks| chunks.get(&index))
            .cloned()
            .ok_or_else(|| VaultError::chunk_not_found(tensor, index))?;
        self.counters.record_read(payload.data.len());
        Ok(payload)
    }

    async fn delete(&self, tensor: TensorId) -> Result<usize> {
        let removed = self
            .arena
            .write()
            .await
            .remove(&tensor)
            .map(|chunks| chunks.len())
            .unwrap_or(0);
        if removed > 0 {
            debug!(tensor_id = %tensor, removed, "Dropped chunks from memory");
        }
        Ok(removed)
    }

    async fn indices(&self, tensor: TensorId) -> Result<Vec<u32>> {
        let arena = self.arena.read().await;
        Ok(arena
            .get(&tensor)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn tensors(&self) -> Result<Vec<TensorId>> {
        let arena = self.arena.read().await;
        Ok(arena
            .iter()
            .filter(|(_, chunks)| !chunks.is_empty())
            .map(|(id, _)| *id)
            .collect())
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}
