//! Stage timing for profiling.
//!
//! Timing is collected only when the `profiling` feature is enabled. Without it
//! the collector and [`time_stage!`](crate::time_stage) compile to no-ops and every
//! reported duration is zero.

use serde::{Deserialize, Serialize};
use std::time::Duration;
#[cfg(feature = "profiling")]
use std::time::Instant;

use crate::error::Stage;

/// Timing breakdown for one search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchTiming {
    /// Wall time of the whole search, planning and allocation included
    pub total_ms: f64,
    /// Host-to-device copies (reference once, queries per batch)
    pub upload_ms: f64,
    pub reference_norm_ms: f64,
    pub query_norm_ms: f64,
    /// Dense `-2·qᵀr` product
    pub cross_term_ms: f64,
    pub reference_norm_add_ms: f64,
    pub top_k_ms: f64,
    pub query_norm_sqrt_ms: f64,
    /// Device-to-host copies of the selected rows
    pub download_ms: f64,
    /// Per-batch totals, in processing order
    pub batches: Vec<BatchTiming>,
}

/// Timing for one query batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchTiming {
    pub start: usize,
    pub len: usize,
    pub total_ms: f64,
}

#[cfg(feature = "profiling")]
impl SearchTiming {
    fn stage_mut(&mut self, stage: Stage) -> &mut f64 {
        match stage {
            Stage::Upload => &mut self.upload_ms,
            Stage::ReferenceNorm => &mut self.reference_norm_ms,
            Stage::QueryNorm => &mut self.query_norm_ms,
            Stage::CrossTerm => &mut self.cross_term_ms,
            Stage::ReferenceNormAdd => &mut self.reference_norm_add_ms,
            Stage::TopK => &mut self.top_k_ms,
            Stage::QueryNormSqrt => &mut self.query_norm_sqrt_ms,
            Stage::Download => &mut self.download_ms,
        }
    }
}

/// Timer that can be enabled/disabled at compile time.
#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// No-op timer when profiling is disabled.
#[cfg(not(feature = "profiling"))]
pub struct Timer;

#[cfg(not(feature = "profiling"))]
impl Timer {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn elapsed_ms(&self) -> f64 {
        0.0
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Duration::ZERO
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Collector for stage timings during a search.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    search_start: Option<Instant>,
    batch_start: Option<Instant>,
    timing: SearchTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_search(&mut self) {
        self.search_start = Some(Instant::now());
        self.timing = SearchTiming::default();
    }

    pub fn start_batch(&mut self) {
        self.batch_start = Some(Instant::now());
    }

    pub fn record_stage(&mut self, stage: Stage, duration_ms: f64) {
        *self.timing.stage_mut(stage) += duration_ms;
    }

    pub fn end_batch(&mut self, start: usize, len: usize) {
        let total_ms = self
            .batch_start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.timing.batches.push(BatchTiming {
            start,
            len,
            total_ms,
        });
    }

    pub fn finish(&mut self) -> SearchTiming {
        self.timing.total_ms = self
            .search_start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_search(&mut self) {}

    #[inline(always)]
    pub fn start_batch(&mut self) {}

    #[inline(always)]
    pub fn record_stage(&mut self, _stage: Stage, _duration_ms: f64) {}

    #[inline(always)]
    pub fn end_batch(&mut self, _start: usize, _len: usize) {}

    #[inline(always)]
    pub fn finish(&mut self) -> SearchTiming {
        SearchTiming::default()
    }
}

/// Time a pipeline stage and add it to a collector.
///
/// ```ignore
/// time_stage!(collector, Stage::TopK, {
///     backend.select_top_k(&mut work, dist, &mut index, region, k)
/// })?;
/// ```
#[macro_export]
macro_rules! time_stage {
    ($collector:expr, $stage:expr, $block:expr) => {{
        let _timer = $crate::timing::Timer::new();

        let result = $block;

        $collector.record_stage($stage, _timer.elapsed_ms());

        result
    }};
}
