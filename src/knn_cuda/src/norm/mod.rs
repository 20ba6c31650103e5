//! Squared L2 norms of matrix columns.
//!
//! Each column is one point; `norm[c] = Σ_r m[r][c]²`. Columns are independent,
//! so both the host and the device versions parallelize over columns with no
//! coordination.

#[cfg(feature = "cuda")]
pub mod kernels;

use rayon::prelude::*;

use crate::matrix::MatrixRegion;

/// Host version: writes the norms of `points` to
/// `buffer[norm_offset..norm_offset + points.cols]`.
///
/// The norm row must start at or after the end of `points`.
pub fn compute_squared_norms_cpu(buffer: &mut [f32], points: MatrixRegion, norm_offset: usize) {
    debug_assert!(points.end() <= norm_offset);
    let (head, tail) = buffer.split_at_mut(norm_offset);
    let head = &*head;

    tail[..points.cols]
        .par_iter_mut()
        .enumerate()
        .for_each(|(col, norm)| {
            let mut sum = 0.0f32;
            for row in 0..points.rows {
                let value = head[points.index(row, col)];
                sum += value * value;
            }
            *norm = sum;
        });
}
