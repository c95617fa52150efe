//! Chunk persistence.
//!
//! - [`chunk_store`]: the `ChunkStore` contract and the in-memory arena
//! - [`disk`]: one-file-per-chunk backend with optional zstd at rest
//! - [`manifest`]: JSON manifests of finalized tensors for the disk backend

pub mod chunk_store;
pub mod disk;
pub mod manifest;

pub use chunk_store::{ChunkPayload, ChunkStore, MemoryChunkStore, StoreStats};
pub use disk::DiskChunkStore;
