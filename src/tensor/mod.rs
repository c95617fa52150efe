//! Tensor metadata types.
//!
//! - [`dtype`]: element types and byte codecs
//! - [`descriptor`]: identities, lifecycle state and chunk metadata

pub mod descriptor;
pub mod dtype;
