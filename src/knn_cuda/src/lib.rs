//! Memory-budgeted brute-force k-nearest-neighbor search.
//!
//! Every query point is compared against every reference point using the
//! expanded Euclidean distance, and the `k` closest references are kept per
//! query. The reference set stays resident on the device while queries are
//! streamed through in batches sized to a fraction of free device memory.
//!
//! # Architecture
//!
//! The search is split into stages, each run by a [`KnnBackend`]:
//! - Norm computation: squared L2 norm of every reference and query point
//! - Cross term: dense `-2·qᵀr` product (cuBLAS on CUDA, nalgebra on the host)
//! - Distance assembly: add reference norms, later query norms and `sqrt`
//! - Top-k selection: bounded insertion sort down each distance column
//!
//! [`batch`] sizes the query batches and [`memory`] owns the device workspace.
//!
//! # Usage
//!
//! ```ignore
//! use knn_cuda::{knn_search, PointSet};
//!
//! let reference = PointSet::from_points(&[[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]])?;
//! let query = PointSet::from_points(&[[1.0, 1.0]])?;
//!
//! let result = knn_search(&reference, &query, 2)?;
//! for neighbor in result.neighbors(0) {
//!     println!("{} at {}", neighbor.index, neighbor.distance);
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod distance;
pub mod error;
pub mod matrix;
pub mod memory;
pub mod norm;
pub mod points;
pub mod search;
pub mod select;
pub mod test_utils;
pub mod timing;

pub use backend::cpu::CpuBackend;
pub use backend::KnnBackend;
pub use batch::{BatchPlan, ProblemShape, QueryBatch, BATCH_GRANULARITY};
pub use error::{KnnError, Result, Stage};
pub use memory::{MemoryInfo, Workspace, WorkspaceLayout};
pub use points::{KnnResult, Neighbor, PointSet};
pub use select::BoundedSortedArray;
pub use timing::{BatchTiming, SearchTiming};

// High-level API (recommended for most users)
pub use search::{
    knn_search, knn_search_with_config, KnnSearcher, SearchConfig, SearchConfigBuilder,
};

// CUDA backend (optional, requires the `cuda` feature)
#[cfg(feature = "cuda")]
pub use backend::cuda::{is_cuda_available, CudaBackend};

/// Print from tests only when the `test-verbose` feature is enabled.
#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {
        if cfg!(feature = "test-verbose") {
            println!($($arg)*);
        }
    };
}
