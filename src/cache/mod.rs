//! Inference caches layered on the tensor catalog.
//!
//! - [`activation`]: (model, layer, input fingerprint) -> tensor, LRU + TTL bounded
//! - [`kv`]: per-session key/value tensors indexed by layer and position
//!
//! Both hold catalog references, never ownership of tensor data.

pub mod activation;
pub mod kv;

pub use activation::{ActivationCache, ActivationKey, ActivationStats, Fingerprint};
pub use kv::{KvCache, KvEntry, SessionId};
