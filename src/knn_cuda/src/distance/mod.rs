//! Squared-distance assembly via the expanded Euclidean formula.
//!
//! ```text
//! ‖q − r‖² = ‖q‖² + ‖r‖² − 2·q·r
//! ```
//!
//! The pipeline fills the distance matrix (`ref_width × batch`) in three passes:
//! 1. cross term `-2·q·r` (dense matrix product),
//! 2. `+ ‖r‖²` broadcast along rows,
//! 3. after top-k selection, `+ ‖q‖²` and `sqrt` on the first `k` rows only.
//!
//! Rows past `k` are left as partial sums. No clamping is applied: a sum that
//! cancels to a tiny negative value stays negative and its square root is NaN.

#[cfg(feature = "cuda")]
pub mod kernels;

use nalgebra::{DMatrixView, DMatrixViewMut, Dyn};
use rayon::prelude::*;

use crate::matrix::MatrixRegion;

/// Host cross term: `dist ← -2 · queryᵀ · reference`.
///
/// `query` (`height × batch`) and `dist` (`ref_width × batch`) are regions of
/// `work`, with `query` entirely before `dist`. `reference` (`height × ref_width`)
/// is a region of `reference_buffer`.
pub fn cross_term_cpu(
    work: &mut [f32],
    query: MatrixRegion,
    dist: MatrixRegion,
    reference_buffer: &[f32],
    reference: MatrixRegion,
) {
    debug_assert_eq!(query.rows, reference.rows);
    debug_assert_eq!(dist.rows, reference.cols);
    debug_assert_eq!(dist.cols, query.cols);
    debug_assert!(query.end() <= dist.offset);

    let (head, tail) = work.split_at_mut(dist.offset);

    // Row-major pitched storage is a matrix with row stride `pitch`, column stride 1.
    let query_view = DMatrixView::<f32, Dyn, Dyn>::from_slice_with_strides(
        &head[query.offset..],
        query.rows,
        query.cols,
        query.pitch,
        1,
    );
    let reference_view = DMatrixView::<f32, Dyn, Dyn>::from_slice_with_strides(
        &reference_buffer[reference.offset..],
        reference.rows,
        reference.cols,
        reference.pitch,
        1,
    );
    let mut dist_view = DMatrixViewMut::<f32, Dyn, Dyn>::from_slice_with_strides_mut(
        tail, dist.rows, dist.cols, dist.pitch, 1,
    );

    // dist = -2 · referenceᵀ · query, i.e. dist[r][c] = -2 Σ_d ref[d][r]·query[d][c]
    dist_view.gemm_tr(-2.0, &reference_view, &query_view, 0.0);
}

/// Host pass 1: `dist[r][c] += reference_norms[r]`.
pub fn add_reference_norm_cpu(
    work: &mut [f32],
    dist: MatrixRegion,
    reference_buffer: &[f32],
    norm_offset: usize,
) {
    let norms = &reference_buffer[norm_offset..norm_offset + dist.rows];
    work[dist.offset..dist.end()]
        .par_chunks_mut(dist.pitch)
        .zip(norms.par_iter())
        .for_each(|(row, &norm)| {
            for value in &mut row[..dist.cols] {
                *value += norm;
            }
        });
}

/// Host pass 2: `dist[r][c] = sqrt(dist[r][c] + query_norms[c])` over the rows of
/// `dist`.
pub fn add_query_norm_and_sqrt_cpu(work: &mut [f32], dist: MatrixRegion, norm_offset: usize) {
    debug_assert!(dist.end() <= norm_offset);
    let (head, tail) = work.split_at_mut(norm_offset);
    let norms = &tail[..dist.cols];

    head[dist.offset..dist.end()]
        .par_chunks_mut(dist.pitch)
        .for_each(|row| {
            for (value, &norm) in row[..dist.cols].iter_mut().zip(norms) {
                *value = (*value + norm).sqrt();
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Work buffer for 2-D points: query rows 0..2, distance rows 2..5, norm row 5.
    fn layout(batch: usize, pitch: usize) -> (MatrixRegion, MatrixRegion, usize) {
        let query = MatrixRegion::new(0, 2, batch, pitch);
        let dist = MatrixRegion::new(2 * pitch, 3, batch, pitch);
        (query, dist, 5 * pitch)
    }

    #[test]
    fn test_cross_term_matches_dot_products() {
        let pitch = 4;
        let (query, dist, _) = layout(2, pitch);
        let mut work = vec![0.0f32; 6 * pitch];
        // Queries (1, 1) and (2, -1), stored as rows of coordinates.
        work[0..2].copy_from_slice(&[1.0, 2.0]);
        work[pitch..pitch + 2].copy_from_slice(&[1.0, -1.0]);

        // References (0, 0), (10, 0), (0, 10), pitch 3.
        let reference = MatrixRegion::new(0, 2, 3, 3);
        let reference_buffer = vec![0.0, 10.0, 0.0, 0.0, 0.0, 10.0];

        cross_term_cpu(&mut work, query, dist, &reference_buffer, reference);

        let expected: [[f32; 2]; 3] = [[0.0, 0.0], [-20.0, -40.0], [-20.0, 20.0]];
        for (r, row) in expected.iter().enumerate() {
            for (c, &value) in row.iter().enumerate() {
                assert_relative_eq!(work[dist.index(r, c)], value);
            }
        }
        // Query coordinates are untouched.
        assert_eq!(&work[0..2], &[1.0, 2.0]);
    }

    #[test]
    fn test_norm_passes_complete_distances() {
        let pitch = 2;
        let (query, dist, norm_offset) = layout(1, pitch);
        let mut work = vec![0.0f32; 6 * pitch];
        work[query.index(0, 0)] = 1.0;
        work[query.index(1, 0)] = 1.0;
        work[norm_offset] = 2.0;

        let reference = MatrixRegion::new(0, 2, 3, 3);
        // Coordinates then norm row (0, 100, 100).
        let reference_buffer = vec![0.0, 10.0, 0.0, 0.0, 0.0, 10.0, 0.0, 100.0, 100.0];

        cross_term_cpu(&mut work, query, dist, &reference_buffer, reference);
        add_reference_norm_cpu(&mut work, dist, &reference_buffer, 6);
        assert_relative_eq!(work[dist.index(1, 0)], 80.0);

        add_query_norm_and_sqrt_cpu(&mut work, dist, norm_offset);
        assert_relative_eq!(work[dist.index(0, 0)], 2.0f32.sqrt());
        assert_relative_eq!(work[dist.index(1, 0)], 82.0f32.sqrt());
        assert_relative_eq!(work[dist.index(2, 0)], 82.0f32.sqrt());
    }

    #[test]
    fn test_sqrt_pass_touches_only_given_rows() {
        let pitch = 1;
        let (_, dist, norm_offset) = layout(1, pitch);
        let mut work = vec![0.0f32; 6];
        work[dist.index(0, 0)] = 7.0;
        work[dist.index(1, 0)] = 14.0;
        work[dist.index(2, 0)] = 23.0;
        work[norm_offset] = 2.0;

        add_query_norm_and_sqrt_cpu(&mut work, dist.with_rows(1), norm_offset);
        assert_relative_eq!(work[dist.index(0, 0)], 3.0);
        assert_eq!(work[dist.index(1, 0)], 14.0);
        assert_eq!(work[dist.index(2, 0)], 23.0);
    }
}
