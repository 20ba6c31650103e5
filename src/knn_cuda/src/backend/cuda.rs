//! CUDA backend: CubeCL kernels for the element-wise stages, cuBLAS for the
//! cross term.
//!
//! Buffers are CubeCL handles. cuBLAS and the partial host copies need raw
//! device pointers, which are taken from the handle bindings, so every stage
//! ends with a CubeCL sync and a context synchronize before the next one touches
//! the same memory. The synchronize is also where asynchronous kernel faults
//! surface; they are reported against the stage that just ran.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;
use cudarc::cublas::sys::{cublasOperation_t, cublasSgemm_v2, cublasStatus_t};
use cudarc::cublas::CudaBlas;
use cudarc::driver::{result as driver, CudaContext};

use super::KnnBackend;
use crate::distance::kernels::{
    add_query_norm_sqrt_kernel, add_reference_norm_kernel, NORM_TILE,
};
use crate::error::{KnnError, Result, Stage};
use crate::matrix::MatrixRegion;
use crate::memory::MemoryInfo;
use crate::norm::kernels::squared_norm_kernel;
use crate::select::kernels::insertion_sort_top_k_kernel;

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Units per cube for the one-unit-per-column kernels.
const BLOCK_SIZE: u32 = 256;

/// Pitched rows are padded to 128 elements (512 bytes for `f32`).
const PITCH_ALIGNMENT: usize = 128;

/// Grid Y limit; the reference-norm kernel tiles reference rows along Y.
const MAX_GRID_Y: usize = 65_535;

/// A device allocation.
pub struct DeviceBuffer {
    handle: Handle,
    len: usize,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// CUDA compute backend.
pub struct CudaBackend {
    /// CUDA device (kept alive for backend lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
    ctx: Arc<CudaContext>,
    blas: CudaBlas,
    device_id: usize,
}

impl CudaBackend {
    /// Create a backend on device 0.
    pub fn new() -> Result<Self> {
        Self::with_device_id(0)
    }

    /// Create a backend on a specific CUDA device.
    pub fn with_device_id(device_id: usize) -> Result<Self> {
        let ctx = CudaContext::new(device_id).map_err(|e| {
            KnnError::Device(format!("CUDA context init failed on device {device_id}: {e}"))
        })?;
        let stream = ctx.default_stream();
        let blas = CudaBlas::new(stream)
            .map_err(|e| KnnError::Device(format!("cuBLAS init failed: {e}")))?;

        // CubeCL panics instead of returning an error when the device is missing.
        let (device, client) = panic::catch_unwind(|| {
            let device = CudaDevice::new(device_id);
            let client = CudaRuntime::client(&device);
            (device, client)
        })
        .map_err(|_| {
            KnnError::Device(format!("CubeCL client init failed on device {device_id}"))
        })?;

        tracing::debug!(device_id, "CUDA kNN backend initialized");

        Ok(Self {
            device,
            client,
            ctx,
            blas,
            device_id,
        })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Get raw CUDA device pointer from CubeCL handle.
    fn raw_ptr(&self, handle: &Handle) -> u64 {
        let binding = handle.clone().binding();
        let resource = self.client.get_resource(binding);
        resource.resource().ptr
    }

    /// Device address of element `offset` of a buffer of `T`.
    fn element_ptr<T>(&self, buffer: &DeviceBuffer, offset: usize) -> u64 {
        self.raw_ptr(&buffer.handle) + (offset * std::mem::size_of::<T>()) as u64
    }

    fn bind(&self, stage: Stage) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| KnnError::fault(stage, e.to_string()))
    }

    /// Block until all queued work is done and report any fault against `stage`.
    fn sync_stage(&self, stage: Stage) -> Result<()> {
        cubecl::future::block_on(self.client.sync());
        self.ctx
            .synchronize()
            .map_err(|e| KnnError::fault(stage, e.to_string()))
    }

    fn allocate(&self, len: usize, element_bytes: usize) -> Result<DeviceBuffer> {
        let bytes = len * element_bytes;
        if len > u32::MAX as usize {
            return Err(KnnError::Device(format!(
                "buffer of {len} elements exceeds 32-bit kernel indexing"
            )));
        }
        let free = self.memory_info()?.free_bytes;
        if bytes as u64 > free {
            return Err(KnnError::OutOfMemory {
                bytes: bytes as u64,
            });
        }

        let client = &self.client;
        let handle = panic::catch_unwind(AssertUnwindSafe(|| client.empty(bytes)))
            .map_err(|_| KnnError::OutOfMemory {
                bytes: bytes as u64,
            })?;
        Ok(DeviceBuffer { handle, len })
    }

    fn check_bounds(
        buffer: &DeviceBuffer,
        offset: usize,
        len: usize,
        stage: Stage,
    ) -> Result<()> {
        if offset + len > buffer.len {
            return Err(KnnError::fault(
                stage,
                format!(
                    "range {offset}..{} outside buffer of {} elements",
                    offset + len,
                    buffer.len
                ),
            ));
        }
        Ok(())
    }

    fn column_cubes(width: usize) -> CubeCount {
        CubeCount::Static((width as u32).div_ceil(BLOCK_SIZE), 1, 1)
    }
}

impl KnnBackend for CudaBackend {
    type FloatBuffer = DeviceBuffer;
    type IndexBuffer = DeviceBuffer;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| KnnError::Device(e.to_string()))?;
        let (free, total) = driver::mem_get_info()
            .map_err(|e| KnnError::Device(format!("memory query failed: {e}")))?;
        Ok(MemoryInfo::new(free as u64, total as u64))
    }

    fn pitch_alignment(&self) -> usize {
        PITCH_ALIGNMENT
    }

    fn max_points_per_axis(&self) -> usize {
        MAX_GRID_Y * NORM_TILE as usize
    }

    fn alloc_floats(&self, len: usize) -> Result<DeviceBuffer> {
        self.allocate(len, std::mem::size_of::<f32>())
    }

    fn alloc_indices(&self, len: usize) -> Result<DeviceBuffer> {
        self.allocate(len, std::mem::size_of::<u32>())
    }

    fn upload(&self, buffer: &mut DeviceBuffer, offset: usize, data: &[f32]) -> Result<()> {
        Self::check_bounds(buffer, offset, data.len(), Stage::Upload)?;
        // The handle may still be referenced by queued kernels.
        self.sync_stage(Stage::Upload)?;
        self.bind(Stage::Upload)?;
        let dst = self.element_ptr::<f32>(buffer, offset);
        unsafe { driver::memcpy_htod_sync(dst, data) }
            .map_err(|e| KnnError::fault(Stage::Upload, e.to_string()))
    }

    fn compute_squared_norms(
        &self,
        buffer: &mut DeviceBuffer,
        points: MatrixRegion,
        norm_offset: usize,
        stage: Stage,
    ) -> Result<()> {
        unsafe {
            squared_norm_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                Self::column_cubes(points.cols),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&buffer.handle, buffer.len, 1),
                ScalarArg::new(points.offset as u32),
                ScalarArg::new(points.cols as u32),
                ScalarArg::new(points.pitch as u32),
                ScalarArg::new(points.rows as u32),
                ScalarArg::new(norm_offset as u32),
            );
        }
        self.sync_stage(stage)
    }

    fn cross_term(
        &self,
        work: &mut DeviceBuffer,
        query: MatrixRegion,
        dist: MatrixRegion,
        reference_buffer: &DeviceBuffer,
        reference: MatrixRegion,
    ) -> Result<()> {
        self.bind(Stage::CrossTerm)?;

        // Row-major pitched storage read column-major is the transpose, so with
        // Q (batch × height, ld = query pitch) and R (ref_width × height, ld =
        // reference pitch), C = -2 · Q · Rᵀ (batch × ref_width, ld = query pitch) is
        // exactly the row-major distance matrix.
        let alpha = -2.0f32;
        let beta = 0.0f32;
        let query_ptr = self.element_ptr::<f32>(work, query.offset);
        let reference_ptr = self.element_ptr::<f32>(reference_buffer, reference.offset);
        let dist_ptr = self.element_ptr::<f32>(work, dist.offset);

        let status = unsafe {
            cublasSgemm_v2(
                *self.blas.handle(),
                cublasOperation_t::CUBLAS_OP_N,
                cublasOperation_t::CUBLAS_OP_T,
                query.cols as i32,
                reference.cols as i32,
                query.rows as i32,
                &alpha,
                query_ptr as *const f32,
                query.pitch as i32,
                reference_ptr as *const f32,
                reference.pitch as i32,
                &beta,
                dist_ptr as *mut f32,
                dist.pitch as i32,
            )
        };
        if status != cublasStatus_t::CUBLAS_STATUS_SUCCESS {
            return Err(KnnError::fault(
                Stage::CrossTerm,
                format!("cublasSgemm_v2 failed: {status:?}"),
            ));
        }
        self.sync_stage(Stage::CrossTerm)
    }

    fn add_reference_norm(
        &self,
        work: &mut DeviceBuffer,
        dist: MatrixRegion,
        reference_buffer: &DeviceBuffer,
        norm_offset: usize,
    ) -> Result<()> {
        let cubes_x = (dist.cols as u32).div_ceil(NORM_TILE);
        let cubes_y = (dist.rows as u32).div_ceil(NORM_TILE);

        unsafe {
            add_reference_norm_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cubes_x, cubes_y, 1),
                CubeDim::new(NORM_TILE, NORM_TILE, 1),
                ArrayArg::from_raw_parts::<f32>(&work.handle, work.len, 1),
                ScalarArg::new(dist.offset as u32),
                ScalarArg::new(dist.pitch as u32),
                ScalarArg::new(dist.cols as u32),
                ScalarArg::new(dist.rows as u32),
                ArrayArg::from_raw_parts::<f32>(
                    &reference_buffer.handle,
                    reference_buffer.len,
                    1,
                ),
                ScalarArg::new(norm_offset as u32),
            );
        }
        self.sync_stage(Stage::ReferenceNormAdd)
    }

    fn select_top_k(
        &self,
        work: &mut DeviceBuffer,
        dist: MatrixRegion,
        index: &mut DeviceBuffer,
        index_region: MatrixRegion,
        k: usize,
    ) -> Result<()> {
        unsafe {
            insertion_sort_top_k_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                Self::column_cubes(dist.cols),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&work.handle, work.len, 1),
                ScalarArg::new(dist.offset as u32),
                ScalarArg::new(dist.pitch as u32),
                ArrayArg::from_raw_parts::<u32>(&index.handle, index.len, 1),
                ScalarArg::new(index_region.pitch as u32),
                ScalarArg::new(dist.cols as u32),
                ScalarArg::new(dist.rows as u32),
                ScalarArg::new(k as u32),
            );
        }
        self.sync_stage(Stage::TopK)
    }

    fn add_query_norm_and_sqrt(
        &self,
        work: &mut DeviceBuffer,
        dist: MatrixRegion,
        norm_offset: usize,
    ) -> Result<()> {
        unsafe {
            add_query_norm_sqrt_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                Self::column_cubes(dist.cols),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&work.handle, work.len, 1),
                ScalarArg::new(dist.offset as u32),
                ScalarArg::new(dist.pitch as u32),
                ScalarArg::new(dist.cols as u32),
                ScalarArg::new(dist.rows as u32),
                ScalarArg::new(norm_offset as u32),
            );
        }
        self.sync_stage(Stage::QueryNormSqrt)
    }

    fn download_floats(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        len: usize,
    ) -> Result<Vec<f32>> {
        Self::check_bounds(buffer, offset, len, Stage::Download)?;
        self.bind(Stage::Download)?;
        let mut host = vec![0.0f32; len];
        let src = self.element_ptr::<f32>(buffer, offset);
        unsafe { driver::memcpy_dtoh_sync(&mut host, src) }
            .map_err(|e| KnnError::fault(Stage::Download, e.to_string()))?;
        Ok(host)
    }

    fn download_indices(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u32>> {
        Self::check_bounds(buffer, offset, len, Stage::Download)?;
        self.bind(Stage::Download)?;
        let mut host = vec![0u32; len];
        let src = self.element_ptr::<u32>(buffer, offset);
        unsafe { driver::memcpy_dtoh_sync(&mut host, src) }
            .map_err(|e| KnnError::fault(Stage::Download, e.to_string()))?;
        Ok(host)
    }

    fn release_unused(&self) {
        // Dropped handles only go back to CubeCL's pool; cleanup frees the
        // pages that no live handle points into.
        cubecl::future::block_on(self.client.sync());
        self.client.memory_cleanup();
        tracing::debug!(device_id = self.device_id, "released pooled device memory");
    }
}

/// Check if CUDA is available.
pub fn is_cuda_available() -> bool {
    // Try to create a device - if it fails, CUDA is not available
    std::panic::catch_unwind(|| {
        let _device = CudaDevice::new(0);
    })
    .is_ok()
        && CudaContext::new(0).is_ok()
}
