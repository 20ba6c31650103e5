//! Device workspace allocation.
//!
//! A search holds exactly three device buffers for its whole lifetime:
//!
//! ```text
//! work      (height + ref_width + 1) × pitch(batch)   f32
//!           ├─ rows [0, height)                 query coordinates
//!           ├─ rows [height, height + ref_width) distance matrix
//!           └─ row  height + ref_width          query norms
//! reference (height + 1) × pitch(ref_width)       f32
//!           ├─ rows [0, height)                 reference coordinates
//!           └─ row  height                      reference norms
//! index     k × pitch(batch)                      u32 (1-based)
//! ```
//!
//! [`Workspace`] owns them; dropping it releases all three.

use serde::{Deserialize, Serialize};

use crate::backend::KnnBackend;
use crate::batch::ProblemShape;
use crate::error::Result;
use crate::matrix::{padded_pitch, MatrixRegion};

/// Device memory as reported by the capacity query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryInfo {
    pub fn new(free_bytes: u64, total_bytes: u64) -> Self {
        Self {
            free_bytes,
            total_bytes,
        }
    }
}

/// Shapes and offsets of the workspace buffers for one batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub dimension: usize,
    pub reference_count: usize,
    pub k: usize,
    pub batch_size: usize,
    /// Row stride of the work and index buffers.
    pub query_pitch: usize,
    /// Row stride of the reference buffer.
    pub reference_pitch: usize,
}

impl WorkspaceLayout {
    pub fn new(shape: &ProblemShape, batch_size: usize, alignment: usize) -> Self {
        Self {
            dimension: shape.dimension,
            reference_count: shape.reference_count,
            k: shape.k,
            batch_size,
            query_pitch: padded_pitch(batch_size, alignment),
            reference_pitch: padded_pitch(shape.reference_count, alignment),
        }
    }

    /// Elements in the work buffer.
    pub fn work_len(&self) -> usize {
        (self.dimension + self.reference_count + 1) * self.query_pitch
    }

    /// Elements in the reference buffer.
    pub fn reference_len(&self) -> usize {
        (self.dimension + 1) * self.reference_pitch
    }

    /// Elements in the index buffer.
    pub fn index_len(&self) -> usize {
        self.k * self.query_pitch
    }

    /// Padded footprint of all three buffers.
    pub fn total_bytes(&self) -> u64 {
        ((self.work_len() + self.reference_len()) * std::mem::size_of::<f32>()
            + self.index_len() * std::mem::size_of::<u32>()) as u64
    }

    /// Query coordinates for a batch of `cols` queries.
    pub fn query(&self, cols: usize) -> MatrixRegion {
        MatrixRegion::new(0, self.dimension, cols, self.query_pitch)
    }

    /// Distance matrix (`ref_width × cols`).
    pub fn distances(&self, cols: usize) -> MatrixRegion {
        MatrixRegion::new(
            self.dimension * self.query_pitch,
            self.reference_count,
            cols,
            self.query_pitch,
        )
    }

    /// Offset of the query norm row in the work buffer.
    pub fn query_norm_offset(&self) -> usize {
        (self.dimension + self.reference_count) * self.query_pitch
    }

    /// Reference coordinates.
    pub fn reference(&self) -> MatrixRegion {
        MatrixRegion::new(
            0,
            self.dimension,
            self.reference_count,
            self.reference_pitch,
        )
    }

    /// Offset of the reference norm row in the reference buffer.
    pub fn reference_norm_offset(&self) -> usize {
        self.dimension * self.reference_pitch
    }

    /// Index matrix (`k × cols`).
    pub fn indices(&self, cols: usize) -> MatrixRegion {
        MatrixRegion::new(0, self.k, cols, self.query_pitch)
    }
}

/// The three device buffers of one search.
pub struct Workspace<B: KnnBackend> {
    pub(crate) work: B::FloatBuffer,
    pub(crate) reference: B::FloatBuffer,
    pub(crate) index: B::IndexBuffer,
    layout: WorkspaceLayout,
}

impl<B: KnnBackend> Workspace<B> {
    /// Allocate every buffer for `layout`.
    ///
    /// If an allocation fails, the buffers acquired before it are dropped on the
    /// way out, so nothing stays reserved.
    pub fn allocate(backend: &B, layout: WorkspaceLayout) -> Result<Self> {
        tracing::debug!(
            backend = backend.name(),
            work_floats = layout.work_len(),
            reference_floats = layout.reference_len(),
            index_entries = layout.index_len(),
            total_bytes = layout.total_bytes(),
            "allocating kNN workspace"
        );

        let work = backend.alloc_floats(layout.work_len())?;
        let reference = backend.alloc_floats(layout.reference_len())?;
        let index = backend.alloc_indices(layout.index_len())?;

        Ok(Self {
            work,
            reference,
            index,
            layout,
        })
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }
}

impl<B: KnnBackend> Drop for Workspace<B> {
    fn drop(&mut self) {
        tracing::debug!(
            total_bytes = self.layout.total_bytes(),
            "releasing kNN workspace"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::error::KnnError;

    fn shape() -> ProblemShape {
        ProblemShape {
            reference_count: 5,
            query_count: 40,
            dimension: 3,
            k: 2,
        }
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        let layout = WorkspaceLayout::new(&shape(), 16, 1);
        let query = layout.query(16);
        let distances = layout.distances(16);

        assert_eq!(query.end(), distances.offset);
        assert_eq!(distances.end(), layout.query_norm_offset());
        assert_eq!(layout.query_norm_offset() + layout.query_pitch, layout.work_len());
        assert_eq!(layout.reference().end(), layout.reference_norm_offset());
        assert_eq!(layout.indices(16).end(), layout.index_len());
    }

    #[test]
    fn test_layout_byte_count() {
        let layout = WorkspaceLayout::new(&shape(), 16, 1);
        // (3 + 5 + 1) * 16 + 4 * 5 floats, 2 * 16 indices
        assert_eq!(layout.total_bytes(), ((144 + 20) * 4 + 32 * 4) as u64);

        let padded = WorkspaceLayout::new(&shape(), 16, 128);
        assert_eq!(padded.query_pitch, 128);
        assert_eq!(padded.reference_pitch, 128);
        assert!(padded.total_bytes() > layout.total_bytes());
    }

    #[test]
    fn test_workspace_releases_on_drop() {
        let backend = CpuBackend::new();
        let layout = WorkspaceLayout::new(&shape(), 16, 1);
        {
            let workspace = Workspace::allocate(&backend, layout).unwrap();
            assert_eq!(backend.allocated_bytes(), workspace.layout().total_bytes());
        }
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn test_workspace_partial_failure_releases_acquired_buffers() {
        let layout = WorkspaceLayout::new(&shape(), 16, 1);
        // Enough for the work buffer but not for the reference buffer as well.
        let limit = (layout.work_len() * 4 + 8) as u64;
        let backend = CpuBackend::new().with_allocation_limit(limit);

        let err = Workspace::allocate(&backend, layout).err().unwrap();
        match err {
            KnnError::OutOfMemory { bytes } => {
                assert_eq!(bytes, (layout.reference_len() * 4) as u64)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.allocated_bytes(), 0);
        assert_eq!(backend.peak_bytes(), (layout.work_len() * 4) as u64);
    }
}
