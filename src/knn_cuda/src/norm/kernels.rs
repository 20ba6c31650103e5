//! CubeCL kernel for column norms.

use cubecl::prelude::*;

/// Compute the squared L2 norm of every column of a pitched matrix.
///
/// One unit per column. The points and the norm row live in the same buffer,
/// so both are addressed by element offset.
///
/// # Inputs
/// - `buffer`: flat storage holding the matrix and the norm row
/// - `points_offset`: element offset of row 0, column 0
/// - `width`: number of columns (points)
/// - `pitch`: elements between consecutive rows
/// - `height`: number of rows (dimensions)
/// - `norm_offset`: element offset of the output norm row
#[cube(launch_unchecked)]
pub fn squared_norm_kernel<F: Float>(
    buffer: &mut Array<F>,
    points_offset: u32,
    width: u32,
    pitch: u32,
    height: u32,
    norm_offset: u32,
) {
    let col = ABSOLUTE_POS;

    if col >= width {
        terminate!();
    }

    let mut sum = F::new(0.0);
    for row in 0..height {
        let value = buffer[points_offset + row * pitch + col];
        sum += value * value;
    }

    buffer[norm_offset + col] = sum;
}
