//! CubeCL kernel for per-column top-k selection.

use cubecl::prelude::*;

/// In-place bounded insertion sort of every distance column.
///
/// One unit per query column. After the kernel, rows `0..k` of each column hold
/// its `k` smallest distances in ascending order and `index` holds their 1-based
/// source rows. Rows past `k` keep whatever was left there by the shifts.
///
/// Same rule as `BoundedSortedArray::try_insert`: the insertion point is the
/// first slot strictly greater than the incoming value, and once `k` values are
/// seeded anything `>=` the current maximum is skipped.
///
/// # Inputs
/// - `work`: buffer holding the distance matrix at `dist_offset`
/// - `dist_pitch`: row stride of the distance matrix
/// - `index`: index matrix, row stride `index_pitch`
/// - `width`: query columns in this batch
/// - `height`: reference rows
/// - `k`: number of neighbors to keep (`1 <= k <= height`)
#[cube(launch_unchecked)]
pub fn insertion_sort_top_k_kernel<F: Float>(
    work: &mut Array<F>,
    dist_offset: u32,
    dist_pitch: u32,
    index: &mut Array<u32>,
    index_pitch: u32,
    width: u32,
    height: u32,
    k: u32,
) {
    let col = ABSOLUTE_POS;

    if col >= width {
        terminate!();
    }

    let base = dist_offset + col;
    index[col] = 1u32;
    let mut max_dist = work[base];

    for l in 1..height {
        let curr = work[base + l * dist_pitch];
        let seeding = l < k;

        if seeding || curr < max_dist {
            // Last occupied slot after this insertion: `l` while seeding, `k - 1` after.
            let mut last = k - 1;
            if seeding {
                last = l;
            }

            // NOTE: no `break` in this scan; CubeCL's uniformity analysis rejects it.
            let mut position = last;
            let mut found = false;
            for j in 0..last {
                if !found && work[base + j * dist_pitch] > curr {
                    position = j;
                    found = true;
                }
            }

            for s in 0..(last - position) {
                let j = last - s;
                work[base + j * dist_pitch] = work[base + (j - 1) * dist_pitch];
                index[col + j * index_pitch] = index[col + (j - 1) * index_pitch];
            }

            work[base + position * dist_pitch] = curr;
            index[col + position * index_pitch] = l + 1;
            max_dist = work[base + last * dist_pitch];
        }
    }
}
