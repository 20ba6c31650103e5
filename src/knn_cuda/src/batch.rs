//! Query batch planning.
//!
//! The whole reference set stays resident; queries are streamed through the
//! device in batches sized so the workspace stays within a fixed fraction of
//! free device memory:
//!
//! ```text
//! usable    = free_bytes × target_fraction
//! fixed     = ref_width × (height + 1) floats               (reference + norms)
//! per_query = (height + ref_width + 1) floats + k indices   (query, distances, norm, indices)
//! batch     = min(query_width, floor16((usable - fixed) / per_query))
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{KnnError, Result};
use crate::memory::WorkspaceLayout;

/// Kernel tiling granularity; memory-bound batch sizes are multiples of this.
pub const BATCH_GRANULARITY: usize = 16;

const FLOAT_BYTES: u64 = std::mem::size_of::<f32>() as u64;
const INDEX_BYTES: u64 = std::mem::size_of::<u32>() as u64;

/// Dimensions of one search problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    /// Reference points (`ref_width`).
    pub reference_count: usize,
    /// Query points (`query_width`).
    pub query_count: usize,
    /// Coordinates per point (`height`).
    pub dimension: usize,
    pub k: usize,
}

impl ProblemShape {
    /// Bytes that do not depend on the batch size.
    pub fn fixed_bytes(&self) -> u64 {
        self.reference_count as u64 * (self.dimension as u64 + 1) * FLOAT_BYTES
    }

    /// Bytes added by each query in a batch.
    pub fn per_query_bytes(&self) -> u64 {
        (self.dimension as u64 + self.reference_count as u64 + 1) * FLOAT_BYTES
            + self.k as u64 * INDEX_BYTES
    }
}

/// Outcome of batch planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Upper bound on queries processed in one pass (`max_nb_query_per_batch`).
    pub max_queries_per_batch: usize,
    /// The byte budget the plan was derived from.
    pub usable_bytes: u64,
}

impl BatchPlan {
    /// Size batches for `shape` given `free_bytes` of device memory, using at most
    /// `target_fraction` of it.
    pub fn plan(free_bytes: u64, target_fraction: f64, shape: &ProblemShape) -> Result<Self> {
        let usable_bytes = (free_bytes as f64 * target_fraction).floor() as u64;
        let fixed = shape.fixed_bytes();
        let per_query = shape.per_query_bytes();
        let insufficient = || KnnError::InsufficientMemory {
            requested_bytes: fixed + BATCH_GRANULARITY as u64 * per_query,
            usable_bytes,
        };

        if usable_bytes <= fixed {
            return Err(insufficient());
        }

        let bound = ((usable_bytes - fixed) / per_query) as usize;
        let bound = bound - bound % BATCH_GRANULARITY;
        if bound == 0 {
            return Err(insufficient());
        }

        Ok(Self {
            max_queries_per_batch: bound.min(shape.query_count),
            usable_bytes,
        })
    }

    /// Shrink the plan until the padded workspace fits the budget.
    ///
    /// The closed-form plan counts logical elements; pitch padding can push the
    /// real footprint past `usable_bytes`.
    pub fn fit_padded(self, shape: &ProblemShape, alignment: usize) -> Result<Self> {
        let mut batch = self.max_queries_per_batch;
        while batch > 0
            && WorkspaceLayout::new(shape, batch, alignment).total_bytes() > self.usable_bytes
        {
            batch = if batch % BATCH_GRANULARITY == 0 {
                batch - BATCH_GRANULARITY
            } else {
                batch - batch % BATCH_GRANULARITY
            };
        }
        if batch == 0 && shape.query_count > 0 {
            let smallest = BATCH_GRANULARITY.min(shape.query_count);
            return Err(KnnError::InsufficientMemory {
                requested_bytes: WorkspaceLayout::new(shape, smallest, alignment).total_bytes(),
                usable_bytes: self.usable_bytes,
            });
        }
        Ok(Self {
            max_queries_per_batch: batch,
            ..self
        })
    }

    /// Apply a user cap on the batch size.
    pub fn capped(self, max_batch_size: Option<usize>) -> Self {
        match max_batch_size {
            Some(cap) => Self {
                max_queries_per_batch: self.max_queries_per_batch.min(cap.max(1)),
                ..self
            },
            None => self,
        }
    }

    /// Iterate the batches covering `query_count` queries.
    pub fn batches(&self, query_count: usize) -> BatchCursor {
        BatchCursor {
            batch_size: self.max_queries_per_batch,
            cursor: 0,
            total: query_count,
        }
    }

    /// Number of batches needed for `query_count` queries.
    pub fn batch_count(&self, query_count: usize) -> usize {
        if self.max_queries_per_batch == 0 {
            0
        } else {
            query_count.div_ceil(self.max_queries_per_batch)
        }
    }
}

/// A contiguous run of queries processed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBatch {
    /// First query column.
    pub start: usize,
    /// Number of queries.
    pub len: usize,
}

/// Walks the query set in increasing order, `min(batch_size, remaining)` at a time.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    batch_size: usize,
    cursor: usize,
    total: usize,
}

impl Iterator for BatchCursor {
    type Item = QueryBatch;

    fn next(&mut self) -> Option<QueryBatch> {
        if self.cursor >= self.total || self.batch_size == 0 {
            return None;
        }
        let len = self.batch_size.min(self.total - self.cursor);
        let batch = QueryBatch {
            start: self.cursor,
            len,
        };
        self.cursor += len;
        Some(batch)
    }
}
