//! tensor-vault: chunked tensor storage with inference caches.
//!
//! Large numeric arrays are written as bounded, write-once chunks, sealed
//! with a BLAKE3 checksum on finalize, and only then become readable.
//! Two caches sit on top of the catalog:
//!   activation cache (model, layer, input fingerprint) -> tensor, LRU + TTL
//!   KV cache (session, layer, position) -> key/value tensors

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod store;
pub mod tensor;

pub use cache::{ActivationCache, ActivationKey, Fingerprint, KvCache, KvEntry, SessionId};
pub use catalog::{Checksum, ReadOptions, TensorCatalog, TensorData, TensorFilter, Verifier};
pub use config::Config;
pub use engine::TensorVault;
pub use error::{Result, VaultError};
pub use tensor::descriptor::{
    ModelId, Retention, TensorDescriptor, TensorId, TensorKind, TensorSpec, TensorState,
};
pub use tensor::dtype::DType;
