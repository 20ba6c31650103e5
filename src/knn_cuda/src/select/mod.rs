//! Partial top-k selection by bounded insertion sort.
//!
//! A column of `H` distances is reduced to its `k` smallest values, ascending,
//! with the 1-based row each value came from:
//!
//! - **seed phase** (rows `0..k`): every value is inserted into the sorted prefix;
//! - **streaming phase** (rows `k..H`): a value `>=` the current maximum is
//!   discarded, anything smaller is inserted and the old maximum falls off.
//!
//! The insertion point is the first slot holding a value strictly greater than
//! the incoming one, in both phases, so among equal values the row scanned first
//! stays first. Worst case is `O(H·k)` per column.

#[cfg(feature = "cuda")]
pub mod kernels;

use rayon::prelude::*;

use crate::matrix::MatrixRegion;

/// Fixed-capacity array kept sorted ascending by value, each value carrying a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedSortedArray<P> {
    capacity: usize,
    values: Vec<f32>,
    payloads: Vec<P>,
}

impl<P: Copy> BoundedSortedArray<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: Vec::with_capacity(capacity),
            payloads: Vec::with_capacity(capacity),
        }
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Largest retained value.
    pub fn max(&self) -> Option<f32> {
        self.values.last().copied()
    }

    /// Insert `value` unless the array is full and `value` is not below the current
    /// maximum. Returns whether the value was kept.
    pub fn try_insert(&mut self, value: f32, payload: P) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let full = self.is_full();
        if full && self.max().is_some_and(|max| value >= max) {
            return false;
        }

        // First slot strictly greater than `value`.
        let position = self.values.partition_point(|&existing| existing <= value);
        if full {
            self.values.pop();
            self.payloads.pop();
        }
        self.values.insert(position, value);
        self.payloads.insert(position, payload);
        true
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn payloads(&self) -> &[P] {
        &self.payloads
    }
}

/// Select the `k` smallest entries of `column` with their 1-based positions.
pub fn select_top_k_column(
    column: impl IntoIterator<Item = f32>,
    k: usize,
) -> BoundedSortedArray<u32> {
    let mut top = BoundedSortedArray::new(k);
    for (row, value) in column.into_iter().enumerate() {
        top.try_insert(value, row as u32 + 1);
    }
    top
}

/// Host selection over every column of `dist`.
///
/// The first `k` rows of each column are overwritten with the selected values;
/// the rest of the column is left as is. Indices go to `index_region`.
pub fn select_top_k_cpu(
    work: &mut [f32],
    dist: MatrixRegion,
    index: &mut [u32],
    index_region: MatrixRegion,
    k: usize,
) {
    let source = &*work;
    let selected: Vec<BoundedSortedArray<u32>> = (0..dist.cols)
        .into_par_iter()
        .map(|col| {
            let column = (0..dist.rows).map(|row| source[dist.index(row, col)]);
            select_top_k_column(column, k)
        })
        .collect();

    for (col, top) in selected.iter().enumerate() {
        for (slot, (&value, &row)) in top.values().iter().zip(top.payloads()).enumerate() {
            work[dist.index(slot, col)] = value;
            index[index_region.index(slot, col)] = row;
        }
    }
}
