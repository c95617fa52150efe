//! Element types and element <-> byte codecs.
//!
//! The store never interprets payload bytes; these helpers exist for callers
//! that hold typed slices and need the persisted layout (host byte order,
//! no padding, `element_count * width` bytes).

use std::fmt;
use std::str::FromStr;

use bytemuck::Pod;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit IEEE float.
    #[default]
    F32,
    /// 16-bit IEEE half.
    F16,
    /// 16-bit brain float.
    BF16,
    F64,
    I64,
    I32,
    I16,
    I8,
    U8,
    /// One byte per element, 0 or 1.
    Bool,
}

impl DType {
    /// Width of a single element in bytes.
    pub const fn byte_width(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    /// Byte length of `elements` elements of this type, or `None` on overflow.
    pub fn bytes_for(self, elements: u64) -> Option<u64> {
        elements.checked_mul(self.byte_width() as u64)
    }

    fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F64 => "f64",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I16 => "i16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f16" | "float16" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f64" | "float64" => Ok(DType::F64),
            "i64" | "int64" => Ok(DType::I64),
            "i32" | "int32" => Ok(DType::I32),
            "i16" | "int16" => Ok(DType::I16),
            "i8" | "int8" => Ok(DType::I8),
            "u8" | "uint8" => Ok(DType::U8),
            "bool" => Ok(DType::Bool),
            other => Err(format!("unknown dtype `{other}`")),
        }
    }
}

/// Rust element types with a fixed [`DType`].
pub trait Element: Pod {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}
impl Element for f64 {
    const DTYPE: DType = DType::F64;
}
impl Element for f16 {
    const DTYPE: DType = DType::F16;
}
impl Element for bf16 {
    const DTYPE: DType = DType::BF16;
}
impl Element for i64 {
    const DTYPE: DType = DType::I64;
}
impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
impl Element for i16 {
    const DTYPE: DType = DType::I16;
}
impl Element for i8 {
    const DTYPE: DType = DType::I8;
}
impl Element for u8 {
    const DTYPE: DType = DType::U8;
}

/// Serialize a typed slice to its persisted byte layout.
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Decode persisted bytes into typed elements.
///
/// Returns `None` when the byte length is not a whole number of elements.
/// The input need not be aligned.
pub fn decode<T: Element>(bytes: &[u8]) -> Option<Vec<T>> {
    if bytes.len() % std::mem::size_of::<T>() != 0 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(bytes))
}

/// Convert f32 values to f16 bytes.
pub fn encode_f32_as_f16(values: &[f32]) -> Vec<u8> {
    let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
    encode(&halves)
}
