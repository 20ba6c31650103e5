//! Host backend.
//!
//! Runs every stage with rayon over host memory. Capacity is synthetic: the
//! backend reports whatever [`MemoryInfo`] it was built with, minus what is
//! currently allocated, and can be given a hard allocation limit. Batching and
//! out-of-memory paths are therefore reproducible without an accelerator.

use std::sync::Arc;

use parking_lot::Mutex;

use super::KnnBackend;
use crate::distance::{add_query_norm_and_sqrt_cpu, add_reference_norm_cpu, cross_term_cpu};
use crate::error::{KnnError, Result, Stage};
use crate::matrix::MatrixRegion;
use crate::memory::MemoryInfo;
use crate::norm::compute_squared_norms_cpu;
use crate::select::select_top_k_cpu;

/// Default synthetic capacity: 1 GiB.
pub const DEFAULT_CPU_MEMORY_BYTES: u64 = 1 << 30;

#[derive(Debug, Default)]
struct MemoryLedger {
    allocated: u64,
    peak: u64,
}

impl MemoryLedger {
    fn acquire(&mut self, bytes: u64) {
        self.allocated += bytes;
        self.peak = self.peak.max(self.allocated);
    }

    fn release(&mut self, bytes: u64) {
        self.allocated -= bytes;
    }
}

/// Host buffer that returns its bytes to the backend ledger when dropped.
pub struct HostBuffer<T> {
    data: Vec<T>,
    ledger: Arc<Mutex<MemoryLedger>>,
}

impl<T> HostBuffer<T> {
    fn bytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<T>()) as u64
    }
}

impl<T> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        let bytes = self.bytes();
        self.ledger.lock().release(bytes);
    }
}

/// CPU compute backend.
#[derive(Clone)]
pub struct CpuBackend {
    memory: MemoryInfo,
    allocation_limit: Option<u64>,
    ledger: Arc<Mutex<MemoryLedger>>,
}

impl CpuBackend {
    /// Backend reporting [`DEFAULT_CPU_MEMORY_BYTES`] free.
    pub fn new() -> Self {
        Self::with_memory(MemoryInfo::new(
            DEFAULT_CPU_MEMORY_BYTES,
            DEFAULT_CPU_MEMORY_BYTES,
        ))
    }

    /// Backend reporting `memory` as its capacity.
    pub fn with_memory(memory: MemoryInfo) -> Self {
        Self {
            memory,
            allocation_limit: None,
            ledger: Arc::new(Mutex::new(MemoryLedger::default())),
        }
    }

    /// Fail any allocation that would push live bytes past `limit`, regardless of
    /// the reported capacity.
    pub fn with_allocation_limit(mut self, limit: u64) -> Self {
        self.allocation_limit = Some(limit);
        self
    }

    /// Bytes currently held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.ledger.lock().allocated
    }

    /// High-water mark of live bytes.
    pub fn peak_bytes(&self) -> u64 {
        self.ledger.lock().peak
    }

    fn allocate<T: Clone + Default>(&self, len: usize) -> Result<HostBuffer<T>> {
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        {
            let mut ledger = self.ledger.lock();
            let limit = self.allocation_limit.unwrap_or(self.memory.free_bytes);
            if ledger.allocated + bytes > limit {
                return Err(KnnError::OutOfMemory { bytes });
            }
            ledger.acquire(bytes);
        }
        Ok(HostBuffer {
            data: vec![T::default(); len],
            ledger: Arc::clone(&self.ledger),
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KnnBackend for CpuBackend {
    type FloatBuffer = HostBuffer<f32>;
    type IndexBuffer = HostBuffer<u32>;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        let allocated = self.allocated_bytes();
        Ok(MemoryInfo::new(
            self.memory.free_bytes.saturating_sub(allocated),
            self.memory.total_bytes,
        ))
    }

    fn alloc_floats(&self, len: usize) -> Result<HostBuffer<f32>> {
        self.allocate(len)
    }

    fn alloc_indices(&self, len: usize) -> Result<HostBuffer<u32>> {
        self.allocate(len)
    }

    fn upload(&self, buffer: &mut HostBuffer<f32>, offset: usize, data: &[f32]) -> Result<()> {
        let target = buffer
            .data
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| KnnError::fault(Stage::Upload, "write past end of buffer"))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn compute_squared_norms(
        &self,
        buffer: &mut HostBuffer<f32>,
        points: MatrixRegion,
        norm_offset: usize,
        _stage: Stage,
    ) -> Result<()> {
        compute_squared_norms_cpu(&mut buffer.data, points, norm_offset);
        Ok(())
    }

    fn cross_term(
        &self,
        work: &mut HostBuffer<f32>,
        query: MatrixRegion,
        dist: MatrixRegion,
        reference_buffer: &HostBuffer<f32>,
        reference: MatrixRegion,
    ) -> Result<()> {
        cross_term_cpu(&mut work.data, query, dist, &reference_buffer.data, reference);
        Ok(())
    }

    fn add_reference_norm(
        &self,
        work: &mut HostBuffer<f32>,
        dist: MatrixRegion,
        reference_buffer: &HostBuffer<f32>,
        norm_offset: usize,
    ) -> Result<()> {
        add_reference_norm_cpu(&mut work.data, dist, &reference_buffer.data, norm_offset);
        Ok(())
    }

    fn select_top_k(
        &self,
        work: &mut HostBuffer<f32>,
        dist: MatrixRegion,
        index: &mut HostBuffer<u32>,
        index_region: MatrixRegion,
        k: usize,
    ) -> Result<()> {
        select_top_k_cpu(&mut work.data, dist, &mut index.data, index_region, k);
        Ok(())
    }

    fn add_query_norm_and_sqrt(
        &self,
        work: &mut HostBuffer<f32>,
        dist: MatrixRegion,
        norm_offset: usize,
    ) -> Result<()> {
        add_query_norm_and_sqrt_cpu(&mut work.data, dist, norm_offset);
        Ok(())
    }

    fn download_floats(
        &self,
        buffer: &HostBuffer<f32>,
        offset: usize,
        len: usize,
    ) -> Result<Vec<f32>> {
        buffer
            .data
            .get(offset..offset + len)
            .map(<[f32]>::to_vec)
            .ok_or_else(|| KnnError::fault(Stage::Download, "read past end of buffer"))
    }

    fn download_indices(
        &self,
        buffer: &HostBuffer<u32>,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u32>> {
        buffer
            .data
            .get(offset..offset + len)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| KnnError::fault(Stage::Download, "read past end of buffer"))
    }
}
