//! Error taxonomy for the vault.
//!
//! Every variant is surfaced to the caller as-is; nothing here is retried
//! internally. Cache misses are not errors and are modelled as `None`.

use std::ops::Range;

use thiserror::Error;

use crate::tensor::descriptor::{TensorId, TensorState};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("invalid shape {shape:?}: every dimension must be positive")]
    InvalidShape { shape: Vec<usize> },

    #[error("chunk {index} of tensor {tensor_id} already exists")]
    DuplicateChunk { tensor_id: TensorId, index: u32 },

    #[error("KV entry for session {session}, layer {layer}, position {position} already exists")]
    DuplicatePosition {
        session: String,
        layer: u32,
        position: u32,
    },

    #[error("operation `{op}` is not valid for tensor {tensor_id} in state {state:?}")]
    InvalidState {
        tensor_id: TensorId,
        state: TensorState,
        op: &'static str,
    },

    #[error("tensor {tensor_id} is incomplete: chunks hold {actual} elements, expected {expected}")]
    IncompleteTensor {
        tensor_id: TensorId,
        expected: u64,
        actual: u64,
    },

    #[error("checksum conflict on tensor {tensor_id}: expected {expected}, computed {actual}")]
    ChecksumConflict {
        tensor_id: TensorId,
        expected: String,
        actual: String,
    },

    #[error("tensor {tensor_id} is corrupt (chunks {chunks:?}): expected {expected}, computed {actual}")]
    CorruptTensor {
        tensor_id: TensorId,
        chunks: Range<u32>,
        expected: String,
        actual: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tensor {0} is still pending")]
    NotReady(TensorId),

    #[error("chunk {index} of tensor {tensor_id} is {len} bytes, expected {expected} ({elements} elements)")]
    ChunkMisaligned {
        tensor_id: TensorId,
        index: u32,
        len: usize,
        elements: u64,
        expected: u64,
    },

    #[error("activation cache is full and every entry is pinned (capacity {0})")]
    CacheFull(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl VaultError {
    pub(crate) fn tensor_not_found(id: TensorId) -> Self {
        VaultError::NotFound(format!("tensor {id}"))
    }

    pub(crate) fn chunk_not_found(id: TensorId, index: u32) -> Self {
        VaultError::NotFound(format!("chunk {index} of tensor {id}"))
    }

    /// Whether the error indicates damaged stored data rather than a caller mistake.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            VaultError::CorruptTensor { .. } | VaultError::ChecksumConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
