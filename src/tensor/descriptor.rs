//! Tensor identity, lifecycle state and chunk metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::integrity::Checksum;
use crate::tensor::dtype::DType;

/// Opaque unique identifier of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(Uuid);

impl TensorId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TensorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a model in the external model registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub Uuid);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a tensor: `Pending -> Finalized -> Deleted`, or `Pending -> Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorState {
    Pending,
    Finalized,
    Deleted,
}

/// Storage layout recorded for the consumer. The vault does not interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Dense,
    Sparse,
    Quantized,
}

/// Compression applied by the producer before chunking. Recorded only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Zstd,
    Lz4,
    Gzip,
}

/// Role of the tensor inside its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    #[default]
    Weight,
    Bias,
    Embedding,
    Activation,
    Key,
    Value,
    OptimizerState,
    Other,
}

/// Who keeps a tensor alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Part of the catalog's root set. Never reaped, only deleted explicitly.
    #[default]
    Root,
    /// Kept alive by cache references; reaped once no cache refers to it.
    Cached,
}

/// Metadata of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub index: u32,
    pub element_count: u64,
    pub byte_len: u64,
    /// Shape of the slice when the tensor was split along its leading dimension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_shape: Option<Vec<usize>>,
}

/// Descriptor of a stored tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub id: TensorId,
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Product of `shape`.
    pub total_elements: u64,
    pub storage_mode: StorageMode,
    pub compression: Option<Compression>,
    /// Set on finalize.
    pub checksum: Option<Checksum>,
    pub state: TensorState,
    pub kind: TensorKind,
    pub owner: Option<ModelId>,
    pub retention: Retention,
}

impl TensorDescriptor {
    /// Total payload size in bytes.
    pub fn byte_size(&self) -> u64 {
        // Creation rejects shapes whose byte size overflows.
        self.dtype.bytes_for(self.total_elements).unwrap_or(u64::MAX)
    }
}

/// Request to create a tensor.
///
/// Only `name`, `dtype` and `shape` are required; the rest defaults to a dense
/// root weight with no expected checksum.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub kind: TensorKind,
    pub owner: Option<ModelId>,
    pub storage_mode: StorageMode,
    pub compression: Option<Compression>,
    pub retention: Retention,
    pub expected_checksum: Option<Checksum>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
            kind: TensorKind::default(),
            owner: None,
            storage_mode: StorageMode::default(),
            compression: None,
            retention: Retention::default(),
            expected_checksum: None,
        }
    }

    pub fn kind(mut self, kind: TensorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn owner(mut self, owner: ModelId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Checksum the finalized payload must match.
    pub fn expect_checksum(mut self, checksum: Checksum) -> Self {
        self.expected_checksum = Some(checksum);
        self
    }

    /// Product of the shape, or `None` if any dimension is zero or the product overflows.
    pub fn element_count(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |acc, &d| {
            if d == 0 {
                None
            } else {
                acc.checked_mul(d as u64)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count() {
        let spec = TensorSpec::new("w", DType::F32, vec![4, 4]);
        assert_eq!(spec.element_count(), Some(16));

        let zero = TensorSpec::new("z", DType::F32, vec![4, 0]);
        assert_eq!(zero.element_count(), None);

        // Scalars have an empty shape and one element.
        let scalar = TensorSpec::new("s", DType::F32, Vec::new());
        assert_eq!(scalar.element_count(), Some(1));
    }

    #[test]
    fn test_tensor_id_parse() {
        let id = TensorId::new();
        let parsed: TensorId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
