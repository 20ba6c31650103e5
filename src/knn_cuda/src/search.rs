//! Batched brute-force kNN search.
//!
//! [`KnnSearcher::search`] runs the full pipeline on one backend:
//!
//! ```text
//! validate → plan batches → allocate workspace
//!   → upload reference → reference norms
//!   → for each query batch:
//!        upload queries → query norms → cross term → + reference norms
//!        → top-k → + query norms, sqrt (k rows) → download
//!   → release workspace
//! ```
//!
//! Every stage completes before the next one starts. Any error aborts the
//! search; the workspace is dropped on the way out and no partial result is
//! returned.

use serde::{Deserialize, Serialize};

use crate::backend::cpu::CpuBackend;
use crate::backend::KnnBackend;
use crate::batch::{BatchPlan, ProblemShape};
use crate::error::{KnnError, Result, Stage};
use crate::memory::{Workspace, WorkspaceLayout};
use crate::points::{KnnResult, PointSet};
use crate::timing::TimingCollector;

/// Search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Fraction of free device memory the workspace may use, in `(0, 1]`.
    pub memory_fraction: f64,
    /// Upper bound on queries per batch, applied after memory planning.
    pub max_batch_size: Option<usize>,
    /// CUDA device ordinal.
    pub device_id: usize,
    /// Prefer the CUDA backend when it is available.
    pub use_gpu: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            memory_fraction: 0.8,
            max_batch_size: None,
            device_id: 0,
            use_gpu: true,
        }
    }
}

impl SearchConfig {
    pub fn builder() -> SearchConfigBuilder {
        SearchConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(KnnError::InvalidConfig(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if self.max_batch_size == Some(0) {
            return Err(KnnError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SearchConfig`].
#[derive(Debug, Clone)]
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SearchConfig::default(),
        }
    }

    /// Set the fraction of free device memory to plan against.
    pub fn memory_fraction(mut self, fraction: f64) -> Self {
        self.config.memory_fraction = fraction;
        self
    }

    /// Cap the number of queries per batch.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = Some(size);
        self
    }

    pub fn device_id(mut self, id: usize) -> Self {
        self.config.device_id = id;
        self
    }

    /// Enable or disable the CUDA backend in [`knn_search_with_config`].
    pub fn use_gpu(mut self, enable: bool) -> Self {
        self.config.use_gpu = enable;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SearchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SearchConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Brute-force kNN searcher bound to one backend.
pub struct KnnSearcher<B: KnnBackend> {
    backend: B,
    config: SearchConfig,
}

impl<B: KnnBackend> KnnSearcher<B> {
    /// Searcher with the default configuration.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: SearchConfig::default(),
        }
    }

    /// Searcher with a custom configuration.
    pub fn with_config(backend: B, config: SearchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { backend, config })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the current configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Find the `k` nearest reference points of every query point.
    ///
    /// Neighbors come back sorted by ascending Euclidean distance, with 0-based
    /// reference indices. Among equal distances the lower reference index comes
    /// first.
    pub fn search(&self, reference: &PointSet, query: &PointSet, k: usize) -> Result<KnnResult> {
        let result = self.run_pipeline(reference, query, k);
        // The workspace is dropped by now, on success and on error alike.
        self.backend.release_unused();
        result
    }

    fn run_pipeline(&self, reference: &PointSet, query: &PointSet, k: usize) -> Result<KnnResult> {
        let mut timing = TimingCollector::new();
        timing.start_search();

        self.check_inputs(reference, query, k)?;
        if query.is_empty() {
            return Ok(KnnResult::empty(k, self.backend.name()));
        }

        let shape = ProblemShape {
            reference_count: reference.len(),
            query_count: query.len(),
            dimension: reference.dimension(),
            k,
        };
        let alignment = self.backend.pitch_alignment();
        let memory = self.backend.memory_info()?;
        let plan = BatchPlan::plan(memory.free_bytes, self.config.memory_fraction, &shape)?
            .fit_padded(&shape, alignment)?
            .capped(self.config.max_batch_size);
        let batch_count = plan.batch_count(shape.query_count);

        tracing::debug!(
            backend = self.backend.name(),
            reference_count = shape.reference_count,
            query_count = shape.query_count,
            dimension = shape.dimension,
            k,
            free_bytes = memory.free_bytes,
            usable_bytes = plan.usable_bytes,
            batch_size = plan.max_queries_per_batch,
            batch_count,
            "planned kNN search"
        );

        let layout = WorkspaceLayout::new(&shape, plan.max_queries_per_batch, alignment);
        let mut workspace = Workspace::allocate(&self.backend, layout)?;

        let reference_rows =
            reference.to_pitched_rows(0, shape.reference_count, layout.reference_pitch);
        crate::time_stage!(timing, Stage::Upload, {
            self.backend.upload(&mut workspace.reference, 0, &reference_rows)
        })?;
        crate::time_stage!(timing, Stage::ReferenceNorm, {
            self.backend.compute_squared_norms(
                &mut workspace.reference,
                layout.reference(),
                layout.reference_norm_offset(),
                Stage::ReferenceNorm,
            )
        })?;

        let mut distances = vec![0.0f32; k * shape.query_count];
        let mut indices = vec![0usize; k * shape.query_count];

        for batch in plan.batches(shape.query_count) {
            timing.start_batch();

            let query_region = layout.query(batch.len);
            let dist = layout.distances(batch.len);
            let selected = dist.with_rows(k);
            let index_region = layout.indices(batch.len);

            let query_rows = query.to_pitched_rows(batch.start, batch.len, layout.query_pitch);
            crate::time_stage!(timing, Stage::Upload, {
                self.backend.upload(&mut workspace.work, 0, &query_rows)
            })?;
            crate::time_stage!(timing, Stage::QueryNorm, {
                self.backend.compute_squared_norms(
                    &mut workspace.work,
                    query_region,
                    layout.query_norm_offset(),
                    Stage::QueryNorm,
                )
            })?;
            crate::time_stage!(timing, Stage::CrossTerm, {
                self.backend.cross_term(
                    &mut workspace.work,
                    query_region,
                    dist,
                    &workspace.reference,
                    layout.reference(),
                )
            })?;
            crate::time_stage!(timing, Stage::ReferenceNormAdd, {
                self.backend.add_reference_norm(
                    &mut workspace.work,
                    dist,
                    &workspace.reference,
                    layout.reference_norm_offset(),
                )
            })?;
            crate::time_stage!(timing, Stage::TopK, {
                self.backend.select_top_k(
                    &mut workspace.work,
                    dist,
                    &mut workspace.index,
                    index_region,
                    k,
                )
            })?;
            crate::time_stage!(timing, Stage::QueryNormSqrt, {
                self.backend.add_query_norm_and_sqrt(
                    &mut workspace.work,
                    selected,
                    layout.query_norm_offset(),
                )
            })?;

            let (host_distances, host_indices) = crate::time_stage!(timing, Stage::Download, {
                let d = self.backend.download_floats(
                    &workspace.work,
                    selected.offset,
                    selected.span(),
                );
                let i = self.backend.download_indices(
                    &workspace.index,
                    index_region.offset,
                    index_region.span(),
                );
                d.and_then(|d| i.map(|i| (d, i)))
            })?;

            for col in 0..batch.len {
                let out = (batch.start + col) * k;
                for slot in 0..k {
                    let at = slot * layout.query_pitch + col;
                    distances[out + slot] = host_distances[at];
                    indices[out + slot] = (host_indices[at] as usize)
                        .checked_sub(1)
                        .ok_or_else(|| KnnError::fault(Stage::TopK, "neighbor slot left unset"))?;
                }
            }

            timing.end_batch(batch.start, batch.len);
            tracing::debug!(start = batch.start, len = batch.len, "processed query batch");
        }

        drop(workspace);

        Ok(KnnResult {
            k,
            query_count: shape.query_count,
            distances,
            indices,
            batch_size: plan.max_queries_per_batch,
            batch_count,
            backend: self.backend.name().to_string(),
            timing: timing.finish(),
        })
    }

    fn check_inputs(&self, reference: &PointSet, query: &PointSet, k: usize) -> Result<()> {
        if reference.dimension() != query.dimension() {
            return Err(KnnError::DimensionMismatch {
                reference: reference.dimension(),
                query: query.dimension(),
            });
        }
        if k == 0 || k > reference.len() {
            return Err(KnnError::InvalidK {
                k,
                reference_count: reference.len(),
            });
        }
        let limit = self.backend.max_points_per_axis();
        if reference.len() > limit {
            return Err(KnnError::TooManyPoints {
                count: reference.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// kNN search with the default configuration.
///
/// See [`knn_search_with_config`].
pub fn knn_search(reference: &PointSet, query: &PointSet, k: usize) -> Result<KnnResult> {
    knn_search_with_config(reference, query, k, &SearchConfig::default())
}

/// kNN search on the best available backend.
///
/// With `use_gpu` set and the `cuda` feature compiled in, the CUDA backend is
/// tried first; if it cannot be initialized the search falls back to the CPU
/// backend with a warning. Errors from the search itself are not retried.
pub fn knn_search_with_config(
    reference: &PointSet,
    query: &PointSet,
    k: usize,
    config: &SearchConfig,
) -> Result<KnnResult> {
    config.validate()?;

    #[cfg(feature = "cuda")]
    if config.use_gpu {
        match crate::backend::cuda::CudaBackend::with_device_id(config.device_id) {
            Ok(backend) => {
                return KnnSearcher::with_config(backend, config.clone())?
                    .search(reference, query, k);
            }
            Err(e) => {
                tracing::warn!(error = %e, "CUDA backend unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    if config.use_gpu {
        tracing::debug!("built without the cuda feature, using the CPU backend");
    }

    KnnSearcher::with_config(CpuBackend::new(), config.clone())?.search(reference, query, k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::HostBuffer;
    use crate::matrix::MatrixRegion;
    use crate::memory::MemoryInfo;
    use crate::test_utils::{brute_force_knn, clustered_points, uniform_points};
    use approx::assert_relative_eq;

    fn cpu_searcher() -> KnnSearcher<CpuBackend> {
        KnnSearcher::new(CpuBackend::new())
    }

    fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| {
                let d = x as f64 - y as f64;
                d * d
            })
            .sum()
    }

    /// Check a result against the double-precision reference.
    ///
    /// Slots are compared by distance; an index may differ from the reference
    /// only where its own exact distance matches the expected one.
    fn assert_matches_brute_force(
        result: &KnnResult,
        reference: &PointSet,
        query: &PointSet,
        k: usize,
        tolerance: f64,
    ) {
        let expected = brute_force_knn(reference, query, k);
        for (q, neighbors) in expected.iter().enumerate() {
            for (slot, &(index, distance)) in neighbors.iter().enumerate() {
                let got = result.indices_for(q)[slot];
                assert_relative_eq!(
                    result.distances_for(q)[slot] as f64,
                    distance,
                    epsilon = tolerance,
                    max_relative = tolerance
                );
                if got != index {
                    let exact = squared_distance(query.point(q), reference.point(got)).sqrt();
                    assert_relative_eq!(exact, distance, epsilon = tolerance);
                }
            }
        }
    }

    #[test]
    fn test_three_point_scenario() {
        let reference = PointSet::from_points(&[[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]]).unwrap();
        let query = PointSet::from_points(&[[1.0, 1.0]]).unwrap();

        let result = cpu_searcher().search(&reference, &query, 2).unwrap();

        assert_eq!(result.query_count, 1);
        assert_eq!(result.indices_for(0), &[0, 1]);
        assert_relative_eq!(result.distances_for(0)[0], 2.0f32.sqrt());
        assert_relative_eq!(result.distances_for(0)[1], 82.0f32.sqrt());
    }

    #[test]
    fn test_matches_brute_force() {
        let reference = uniform_points(500, 4, 1).unwrap();
        let query = uniform_points(123, 4, 2).unwrap();
        let k = 7;

        let result = cpu_searcher().search(&reference, &query, k).unwrap();

        assert_eq!(result.distances.len(), k * query.len());
        assert_matches_brute_force(&result, &reference, &query, k, 1e-4);
    }

    #[test]
    fn test_clustered_data_matches_brute_force() {
        let reference = clustered_points(400, 3, 5, 0.5, 3).unwrap();
        let query = clustered_points(60, 3, 5, 0.5, 4).unwrap();

        let result = cpu_searcher().search(&reference, &query, 5).unwrap();

        assert_matches_brute_force(&result, &reference, &query, 5, 1e-2);
    }

    #[test]
    fn test_neighbors_sorted_and_distinct() {
        let reference = uniform_points(300, 6, 5).unwrap();
        let query = uniform_points(50, 6, 6).unwrap();
        let k = 10;

        let result = cpu_searcher().search(&reference, &query, k).unwrap();

        for q in 0..query.len() {
            let d = result.distances_for(q);
            assert!(d.windows(2).all(|w| w[0] <= w[1]), "query {q} not sorted");

            let mut seen = result.indices_for(q).to_vec();
            assert!(seen.iter().all(|&i| i < reference.len()));
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), k, "query {q} has repeated indices");
        }
    }

    #[test]
    fn test_repeated_search_is_identical() {
        let reference = uniform_points(200, 3, 7).unwrap();
        let query = uniform_points(40, 3, 8).unwrap();
        let searcher = cpu_searcher();

        let first = searcher.search(&reference, &query, 4).unwrap();
        let second = searcher.search(&reference, &query, 4).unwrap();

        assert_eq!(first.indices, second.indices);
        assert_eq!(first.distances, second.distances);
    }

    #[test]
    fn test_k_equal_to_reference_count() {
        let reference = uniform_points(12, 2, 9).unwrap();
        let query = uniform_points(5, 2, 10).unwrap();

        let result = cpu_searcher().search(&reference, &query, 12).unwrap();

        for q in 0..query.len() {
            let mut all = result.indices_for(q).to_vec();
            all.sort_unstable();
            assert_eq!(all, (0..12).collect::<Vec<_>>());
        }
        assert_matches_brute_force(&result, &reference, &query, 12, 1e-4);
    }

    #[test]
    fn test_k_one_is_nearest_neighbor() {
        let reference = uniform_points(100, 3, 11).unwrap();
        let query = uniform_points(30, 3, 12).unwrap();

        let result = cpu_searcher().search(&reference, &query, 1).unwrap();

        assert_eq!(result.k, 1);
        assert_matches_brute_force(&result, &reference, &query, 1, 1e-4);
    }

    #[test]
    fn test_batch_split_matches_single_batch() {
        let reference = uniform_points(150, 5, 13).unwrap();
        let query = uniform_points(100, 5, 14).unwrap();

        let single = cpu_searcher().search(&reference, &query, 6).unwrap();
        let config = SearchConfig::builder().max_batch_size(16).build().unwrap();
        let split = KnnSearcher::with_config(CpuBackend::new(), config)
            .unwrap()
            .search(&reference, &query, 6)
            .unwrap();

        assert_eq!(single.batch_count, 1);
        assert_eq!(split.batch_size, 16);
        assert_eq!(split.batch_count, 7);
        assert_eq!(single.indices, split.indices);
        for (a, b) in single.distances.iter().zip(&split.distances) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_duplicate_points_keep_lowest_indices() {
        let reference =
            PointSet::from_points(&[[1.0, 1.0], [0.0, 0.0], [1.0, 1.0], [1.0, 1.0]]).unwrap();
        let query = PointSet::from_points(&[[1.0, 1.0]]).unwrap();

        let result = cpu_searcher().search(&reference, &query, 2).unwrap();

        assert_eq!(result.indices_for(0), &[0, 2]);
        assert_eq!(result.distances_for(0), &[0.0, 0.0]);
    }

    #[test]
    fn test_invalid_inputs_are_rejected_before_allocation() {
        let backend = CpuBackend::new();
        let searcher = KnnSearcher::new(backend.clone());
        let reference = uniform_points(10, 3, 15).unwrap();
        let query = uniform_points(4, 3, 16).unwrap();
        let empty = PointSet::new(3, Vec::new()).unwrap();

        assert!(matches!(
            searcher.search(&empty, &query, 1),
            Err(KnnError::InvalidK { k: 1, reference_count: 0 })
        ));
        assert!(matches!(
            searcher.search(&reference, &query, 0),
            Err(KnnError::InvalidK { .. })
        ));
        assert!(matches!(
            searcher.search(&reference, &query, 11),
            Err(KnnError::InvalidK { k: 11, reference_count: 10 })
        ));

        let flat = uniform_points(4, 2, 17).unwrap();
        let err = searcher.search(&reference, &flat, 1).unwrap_err();
        assert!(matches!(
            err,
            KnnError::DimensionMismatch { reference: 3, query: 2 }
        ));
        assert!(err.is_precondition_violation());

        assert_eq!(backend.peak_bytes(), 0);
    }

    #[test]
    fn test_empty_query_returns_empty_result() {
        let backend = CpuBackend::new();
        let searcher = KnnSearcher::new(backend.clone());
        let reference = uniform_points(10, 3, 18).unwrap();
        let query = PointSet::new(3, Vec::new()).unwrap();

        let result = searcher.search(&reference, &query, 3).unwrap();

        assert_eq!(result.query_count, 0);
        assert_eq!(result.backend, "cpu");
        assert!(result.distances.is_empty());
        assert!(result.indices.is_empty());
        assert_eq!(backend.peak_bytes(), 0);
    }

    #[test]
    fn test_reference_too_large_for_budget() {
        let backend = CpuBackend::with_memory(MemoryInfo::new(10_000, 10_000));
        let searcher = KnnSearcher::new(backend.clone());
        let reference = uniform_points(1000, 3, 19).unwrap();
        let query = uniform_points(10, 3, 20).unwrap();

        let err = searcher.search(&reference, &query, 1).unwrap_err();

        match err {
            KnnError::InsufficientMemory { usable_bytes, .. } => assert_eq!(usable_bytes, 8000),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn test_allocation_failure_releases_workspace() {
        let backend = CpuBackend::new().with_allocation_limit(4096);
        let searcher = KnnSearcher::new(backend.clone());
        let reference = uniform_points(100, 3, 21).unwrap();
        let query = uniform_points(64, 3, 22).unwrap();

        let err = searcher.search(&reference, &query, 2).unwrap_err();

        assert!(matches!(err, KnnError::OutOfMemory { .. }));
        assert!(err.is_capacity_error());
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn test_peak_memory_stays_within_budget() {
        let free = 200_000u64;
        let backend = CpuBackend::with_memory(MemoryInfo::new(free, free));
        let searcher = KnnSearcher::new(backend.clone());
        let reference = uniform_points(200, 3, 23).unwrap();
        let query = uniform_points(500, 3, 24).unwrap();

        let result = searcher.search(&reference, &query, 5).unwrap();

        // fixed = 3200, per query = 836, usable = 160000 -> 187 -> 176 per batch
        assert_eq!(result.batch_size, 176);
        assert_eq!(result.batch_count, 3);
        assert!(backend.peak_bytes() <= (free as f64 * 0.8) as u64);
        assert!(backend.peak_bytes() > 0);
        assert_eq!(backend.allocated_bytes(), 0);
        assert_matches_brute_force(&result, &reference, &query, 5, 1e-4);
    }

    #[test]
    fn test_config_validation() {
        assert!(SearchConfig::default().validate().is_ok());
        for fraction in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                SearchConfig::builder().memory_fraction(fraction).build(),
                Err(KnnError::InvalidConfig(_))
            ));
        }
        assert!(SearchConfig::builder().memory_fraction(1.0).build().is_ok());
        assert!(SearchConfig::builder().max_batch_size(0).build().is_err());

        let config = SearchConfig {
            memory_fraction: 2.0,
            ..SearchConfig::default()
        };
        assert!(KnnSearcher::with_config(CpuBackend::new(), config).is_err());
    }

    #[test]
    fn test_knn_search_convenience() {
        let reference = PointSet::from_points(&[[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]]).unwrap();
        let query = PointSet::from_points(&[[1.0, 1.0], [9.0, 0.0]]).unwrap();

        let result = knn_search(&reference, &query, 1).unwrap();

        assert_eq!(result.indices, vec![0, 1]);
        if !cfg!(feature = "cuda") {
            assert_eq!(result.backend, "cpu");
        }

        let host_only = SearchConfig::builder().use_gpu(false).build().unwrap();
        let result = knn_search_with_config(&reference, &query, 1, &host_only).unwrap();
        assert_eq!(result.backend, "cpu");
        assert_relative_eq!(result.distances[1], 1.0, epsilon = 1e-4);
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn test_timing_records_every_batch() {
        let reference = uniform_points(50, 3, 25).unwrap();
        let query = uniform_points(40, 3, 26).unwrap();
        let config = SearchConfig::builder().max_batch_size(16).build().unwrap();

        let result = KnnSearcher::with_config(CpuBackend::new(), config)
            .unwrap()
            .search(&reference, &query, 2)
            .unwrap();

        assert_eq!(result.timing.batches.len(), 3);
        assert_eq!(result.timing.batches[2].len, 8);
        assert!(result.timing.total_ms >= result.timing.top_k_ms);
    }

    /// CPU backend whose top-k stage fails after `fail_on_batch` successful calls.
    struct FaultyBackend {
        inner: CpuBackend,
        fail_on_batch: usize,
        calls: std::cell::Cell<usize>,
        /// Workspace bytes still held when `release_unused` ran, per call.
        releases: std::cell::RefCell<Vec<u64>>,
    }

    impl FaultyBackend {
        fn new(inner: CpuBackend, fail_on_batch: usize) -> Self {
            Self {
                inner,
                fail_on_batch,
                calls: std::cell::Cell::new(0),
                releases: std::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl KnnBackend for FaultyBackend {
        type FloatBuffer = HostBuffer<f32>;
        type IndexBuffer = HostBuffer<u32>;

        fn name(&self) -> &'static str {
            "faulty"
        }

        fn memory_info(&self) -> Result<MemoryInfo> {
            self.inner.memory_info()
        }

        fn alloc_floats(&self, len: usize) -> Result<HostBuffer<f32>> {
            self.inner.alloc_floats(len)
        }

        fn alloc_indices(&self, len: usize) -> Result<HostBuffer<u32>> {
            self.inner.alloc_indices(len)
        }

        fn upload(
            &self,
            buffer: &mut HostBuffer<f32>,
            offset: usize,
            data: &[f32],
        ) -> Result<()> {
            self.inner.upload(buffer, offset, data)
        }

        fn compute_squared_norms(
            &self,
            buffer: &mut HostBuffer<f32>,
            points: MatrixRegion,
            norm_offset: usize,
            stage: Stage,
        ) -> Result<()> {
            self.inner
                .compute_squared_norms(buffer, points, norm_offset, stage)
        }

        fn cross_term(
            &self,
            work: &mut HostBuffer<f32>,
            query: MatrixRegion,
            dist: MatrixRegion,
            reference_buffer: &HostBuffer<f32>,
            reference: MatrixRegion,
        ) -> Result<()> {
            self.inner
                .cross_term(work, query, dist, reference_buffer, reference)
        }

        fn add_reference_norm(
            &self,
            work: &mut HostBuffer<f32>,
            dist: MatrixRegion,
            reference_buffer: &HostBuffer<f32>,
            norm_offset: usize,
        ) -> Result<()> {
            self.inner
                .add_reference_norm(work, dist, reference_buffer, norm_offset)
        }

        fn select_top_k(
            &self,
            work: &mut HostBuffer<f32>,
            dist: MatrixRegion,
            index: &mut HostBuffer<u32>,
            index_region: MatrixRegion,
            k: usize,
        ) -> Result<()> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if call == self.fail_on_batch {
                return Err(KnnError::fault(Stage::TopK, "injected fault"));
            }
            self.inner
                .select_top_k(work, dist, index, index_region, k)
        }

        fn add_query_norm_and_sqrt(
            &self,
            work: &mut HostBuffer<f32>,
            dist: MatrixRegion,
            norm_offset: usize,
        ) -> Result<()> {
            self.inner.add_query_norm_and_sqrt(work, dist, norm_offset)
        }

        fn download_floats(
            &self,
            buffer: &HostBuffer<f32>,
            offset: usize,
            len: usize,
        ) -> Result<Vec<f32>> {
            self.inner.download_floats(buffer, offset, len)
        }

        fn download_indices(
            &self,
            buffer: &HostBuffer<u32>,
            offset: usize,
            len: usize,
        ) -> Result<Vec<u32>> {
            self.inner.download_indices(buffer, offset, len)
        }

        fn release_unused(&self) {
            self.releases.borrow_mut().push(self.inner.allocated_bytes());
        }
    }

    #[test]
    fn test_kernel_fault_aborts_and_releases() {
        let inner = CpuBackend::new();
        let backend = FaultyBackend::new(inner.clone(), 1);
        let config = SearchConfig::builder().max_batch_size(16).build().unwrap();
        let searcher = KnnSearcher::with_config(backend, config).unwrap();
        let reference = uniform_points(30, 2, 27).unwrap();
        let query = uniform_points(40, 2, 28).unwrap();

        let err = searcher.search(&reference, &query, 3).unwrap_err();

        assert!(matches!(
            err,
            KnnError::KernelFault { stage: Stage::TopK, .. }
        ));
        assert_eq!(searcher.backend().calls.get(), 2);
        assert!(inner.peak_bytes() > 0);
        assert_eq!(inner.allocated_bytes(), 0);
        assert_eq!(*searcher.backend().releases.borrow(), vec![0]);
    }

    #[test]
    fn test_release_runs_after_workspace_is_dropped() {
        let inner = CpuBackend::new();
        let searcher = KnnSearcher::new(FaultyBackend::new(inner.clone(), usize::MAX));
        let reference = uniform_points(30, 2, 29).unwrap();
        let query = uniform_points(20, 2, 30).unwrap();

        let first = searcher.search(&reference, &query, 3).unwrap();
        let second = searcher.search(&reference, &query, 3).unwrap();

        // One release per search, each seeing no live workspace bytes.
        assert_eq!(*searcher.backend().releases.borrow(), vec![0, 0]);
        assert_eq!(first.backend, "faulty");
        assert!(inner.peak_bytes() > 0);
        assert_eq!(first.batch_size, second.batch_size);
    }
}
