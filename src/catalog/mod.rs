//! Tensor catalog and integrity checks.
//!
//! - [`tensor_catalog`]: lifecycle state machine, reads, references, sweeps
//! - [`integrity`]: BLAKE3 checksums over ordered chunk sequences
//! - [`chunking`]: element-aligned chunk planning for whole-buffer writes

pub mod chunking;
pub mod integrity;
pub mod tensor_catalog;

pub use integrity::{Checksum, Verifier};
pub use tensor_catalog::{ReadOptions, TensorCatalog, TensorData, TensorFilter};
