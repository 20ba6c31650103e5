//! Compute backends.
//!
//! A backend owns the device: it answers the capacity query, hands out flat
//! buffers, moves data across the host boundary, and runs each pipeline stage.
//! Every stage method returns only after the stage has fully completed on the
//! device, so a returned `Ok` is the synchronization point between stages.
//!
//! - [`cpu::CpuBackend`]: rayon data parallelism over host memory with a synthetic
//!   capacity. Always available.
//! - [`cuda::CudaBackend`]: CubeCL kernels plus cuBLAS (feature `cuda`).

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use crate::error::{Result, Stage};
use crate::matrix::MatrixRegion;
use crate::memory::MemoryInfo;

/// Device abstraction used by the search pipeline.
pub trait KnnBackend {
    /// Flat `f32` device buffer.
    type FloatBuffer;
    /// Flat `u32` device buffer.
    type IndexBuffer;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Free and total device memory.
    fn memory_info(&self) -> Result<MemoryInfo>;

    /// Row alignment of pitched buffers, in elements.
    fn pitch_alignment(&self) -> usize {
        1
    }

    /// Largest point count a single launch axis can cover.
    fn max_points_per_axis(&self) -> usize {
        usize::MAX
    }

    /// Allocate `len` floats. Contents are unspecified until written.
    ///
    /// Fails with `OutOfMemory` carrying the byte size.
    fn alloc_floats(&self, len: usize) -> Result<Self::FloatBuffer>;

    /// Allocate `len` indices, same contract as [`alloc_floats`](Self::alloc_floats).
    fn alloc_indices(&self, len: usize) -> Result<Self::IndexBuffer>;

    /// Copy `data` into `buffer` starting at element `offset`.
    fn upload(&self, buffer: &mut Self::FloatBuffer, offset: usize, data: &[f32]) -> Result<()>;

    /// `norms[c] = Σ_r points[r][c]²`, written to `norm_offset..norm_offset + points.cols`
    /// of the same buffer. `stage` names the pass in fault reports.
    fn compute_squared_norms(
        &self,
        buffer: &mut Self::FloatBuffer,
        points: MatrixRegion,
        norm_offset: usize,
        stage: Stage,
    ) -> Result<()>;

    /// `dist ← -2 · queryᵀ · reference` (`dist` is `reference.cols × query.cols`).
    ///
    /// `query` and `dist` live in `work`; `reference` lives in `reference_buffer`.
    fn cross_term(
        &self,
        work: &mut Self::FloatBuffer,
        query: MatrixRegion,
        dist: MatrixRegion,
        reference_buffer: &Self::FloatBuffer,
        reference: MatrixRegion,
    ) -> Result<()>;

    /// `dist[r][c] += reference_norms[r]` for every cell.
    fn add_reference_norm(
        &self,
        work: &mut Self::FloatBuffer,
        dist: MatrixRegion,
        reference_buffer: &Self::FloatBuffer,
        norm_offset: usize,
    ) -> Result<()>;

    /// Move each column's `k` smallest values to its first `k` rows, ascending, and
    /// write their 1-based source rows to `index`.
    fn select_top_k(
        &self,
        work: &mut Self::FloatBuffer,
        dist: MatrixRegion,
        index: &mut Self::IndexBuffer,
        index_region: MatrixRegion,
        k: usize,
    ) -> Result<()>;

    /// `dist[r][c] = sqrt(dist[r][c] + query_norms[c])` for the rows of `dist`
    /// (callers pass the first `k` rows only).
    fn add_query_norm_and_sqrt(
        &self,
        work: &mut Self::FloatBuffer,
        dist: MatrixRegion,
        norm_offset: usize,
    ) -> Result<()>;

    /// Copy `len` floats starting at `offset` back to the host.
    fn download_floats(&self, buffer: &Self::FloatBuffer, offset: usize, len: usize)
        -> Result<Vec<f32>>;

    /// Copy `len` indices starting at `offset` back to the host.
    fn download_indices(
        &self,
        buffer: &Self::IndexBuffer,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u32>>;

    /// Hand memory held by dropped buffers back to the device.
    ///
    /// Called after every search, once the workspace is gone, so the next
    /// capacity query sees the memory as free again. Backends that allocate
    /// straight from the device have nothing to do.
    fn release_unused(&self) {}
}
