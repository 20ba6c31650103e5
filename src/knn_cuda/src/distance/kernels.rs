//! CubeCL kernels for distance assembly.
//!
//! The cross term itself runs through cuBLAS; these kernels add the norms.

use cubecl::prelude::*;

/// Side length of the square tile used by [`add_reference_norm_kernel`].
pub const NORM_TILE: u32 = 16;

/// Add `reference_norms[row]` to every cell of the distance matrix.
///
/// Launched on `NORM_TILE × NORM_TILE` cubes, x over query columns and y over
/// reference rows. The first unit of each tile row loads that row's norm into
/// shared memory once; the rest of the row reads it from there after the
/// barrier.
///
/// # Inputs
/// - `work`: buffer holding the distance matrix at `dist_offset`
/// - `pitch`: row stride of the distance matrix
/// - `width`: query columns in this batch
/// - `height`: reference rows
/// - `reference`: buffer holding the reference norm row at `norm_offset`
#[cube(launch_unchecked)]
pub fn add_reference_norm_kernel<F: Float>(
    work: &mut Array<F>,
    dist_offset: u32,
    pitch: u32,
    width: u32,
    height: u32,
    reference: &Array<F>,
    norm_offset: u32,
) {
    let tx = UNIT_POS_X;
    let ty = UNIT_POS_Y;
    let col = CUBE_POS_X * CUBE_DIM_X + tx;
    let row = CUBE_POS_Y * CUBE_DIM_Y + ty;

    let mut row_norms = SharedMemory::<F>::new(NORM_TILE);

    // No early exit before the barrier: every unit of the cube must reach it.
    if tx == 0 && row < height {
        row_norms[ty] = reference[norm_offset + row];
    }

    sync_cube();

    if row < height && col < width {
        let idx = dist_offset + row * pitch + col;
        work[idx] = work[idx] + row_norms[ty];
    }
}

/// Finalize the first `k` rows: `dist = sqrt(dist + query_norms[col])`.
///
/// One unit per query column; each walks the `k` selected rows. Rows at and
/// past `k` are never touched.
///
/// # Inputs
/// - `work`: buffer holding both the distance matrix and the query norm row
/// - `dist_offset`: element offset of distance row 0
/// - `pitch`: row stride of the distance matrix
/// - `width`: query columns in this batch
/// - `k`: rows to finalize
/// - `norm_offset`: element offset of the query norm row
#[cube(launch_unchecked)]
pub fn add_query_norm_sqrt_kernel<F: Float>(
    work: &mut Array<F>,
    dist_offset: u32,
    pitch: u32,
    width: u32,
    k: u32,
    norm_offset: u32,
) {
    let col = ABSOLUTE_POS;

    if col >= width {
        terminate!();
    }

    let query_norm = work[norm_offset + col];
    for row in 0..k {
        let idx = dist_offset + row * pitch + col;
        work[idx] = F::sqrt(work[idx] + query_norm);
    }
}
