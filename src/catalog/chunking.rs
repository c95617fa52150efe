//! Chunk planning for whole-buffer writes.
//!
//! Boundaries always fall on whole elements. When at least one row of the
//! leading dimension fits the byte budget, chunks hold whole rows and carry
//! the shape of their slice.

use std::ops::Range;

use crate::tensor::dtype::DType;

/// One planned chunk of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u32,
    /// Byte range inside the source buffer.
    pub bytes: Range<usize>,
    pub element_count: u64,
    pub slice_shape: Option<Vec<usize>>,
}

/// Split a `total_bytes` buffer of `dtype` elements into chunks of at most
/// `max_chunk_bytes` (a single element is never split, so one chunk may
/// exceed a budget smaller than the element width).
///
/// `total_bytes` must be the validated byte size of `shape`.
pub fn plan_chunks(
    dtype: DType,
    shape: &[usize],
    total_bytes: usize,
    max_chunk_bytes: usize,
) -> Vec<ChunkPlan> {
    let width = dtype.byte_width();

    if let Some((&rows, rest)) = shape.split_first() {
        let row_elements: usize = rest.iter().product();
        let row_bytes = row_elements * width;
        if row_bytes > 0 && row_bytes <= max_chunk_bytes {
            let rows_per_chunk = (max_chunk_bytes / row_bytes).max(1);
            return (0..rows)
                .step_by(rows_per_chunk)
                .enumerate()
                .map(|(i, start)| {
                    let n = rows_per_chunk.min(rows - start);
                    let mut slice_shape = Vec::with_capacity(shape.len());
                    slice_shape.push(n);
                    slice_shape.extend_from_slice(rest);
                    ChunkPlan {
                        index: i as u32,
                        bytes: start * row_bytes..(start + n) * row_bytes,
                        element_count: (n * row_elements) as u64,
                        slice_shape: Some(slice_shape),
                    }
                })
                .collect();
        }
    }

    let per_chunk = (max_chunk_bytes / width).max(1) * width;
    (0..total_bytes.max(width))
        .step_by(per_chunk)
        .enumerate()
        .map(|(i, start)| {
            let end = (start + per_chunk).min(total_bytes);
            ChunkPlan {
                index: i as u32,
                bytes: start..end,
                element_count: ((end - start) / width) as u64,
                slice_shape: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(plans: &[ChunkPlan], total_elements: u64, total_bytes: usize) {
        let elements: u64 = plans.iter().map(|p| p.element_count).sum();
        assert_eq!(elements, total_elements);
        let mut cursor = 0;
        for (i, plan) in plans.iter().enumerate() {
            assert_eq!(plan.index as usize, i);
            assert_eq!(plan.bytes.start, cursor);
            cursor = plan.bytes.end;
        }
        assert_eq!(cursor, total_bytes);
    }

    #[test]
    fn test_whole_tensor_fits_one_chunk() {
        let plans = plan_chunks(DType::F32, &[4, 4], 64, 1024);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].slice_shape, Some(vec![4, 4]));
        assert_covers(&plans, 16, 64);
    }

    #[test]
    fn test_split_along_leading_dimension() {
        // 10 rows of 8 f32 = 32 bytes per row; 100 bytes fits 3 rows.
        let plans = plan_chunks(DType::F32, &[10, 8], 320, 100);
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0].slice_shape, Some(vec![3, 8]));
        assert_eq!(plans[3].slice_shape, Some(vec![1, 8]));
        assert!(plans.iter().all(|p| p.bytes.len() <= 100));
        assert_covers(&plans, 80, 320);
    }

    #[test]
    fn test_row_larger_than_budget_splits_elements() {
        // One row is 4096 bytes, budget is 1000: fall back to element chunks.
        let plans = plan_chunks(DType::F16, &[2, 2048], 8192, 1000);
        assert!(plans.iter().all(|p| p.slice_shape.is_none()));
        assert!(plans.iter().all(|p| p.bytes.len() <= 1000));
        assert!(plans.iter().all(|p| p.bytes.len() % 2 == 0));
        assert_covers(&plans, 4096, 8192);
    }

    #[test]
    fn test_budget_below_element_width() {
        let plans = plan_chunks(DType::F64, &[3], 24, 4);
        assert_eq!(plans.len(), 3);
        assert!(plans.iter().all(|p| p.bytes.len() == 8));
        assert_covers(&plans, 3, 24);
    }

    #[test]
    fn test_scalar() {
        let plans = plan_chunks(DType::I32, &[], 4, 1024);
        assert_eq!(plans.len(), 1);
        assert_covers(&plans, 1, 4);
    }
}
