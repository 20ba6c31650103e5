//! Synthetic point sets and a reference kNN for tests and verification.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::{KnnError, Result};
use crate::points::PointSet;

/// `count` points drawn uniformly from `[-1, 1)^dimension`.
pub fn uniform_points(count: usize, dimension: usize, seed: u64) -> Result<PointSet> {
    let mut rng = StdRng::seed_from_u64(seed);
    let uniform = Uniform::new(-1.0f32, 1.0);
    let data = (0..count * dimension).map(|_| uniform.sample(&mut rng)).collect();
    PointSet::new(dimension, data)
}

/// `count` points from `clusters` isotropic Gaussian blobs with centers in
/// `[-10, 10)^dimension` and standard deviation `spread`.
///
/// Dense clusters produce many near-ties, which is what exercises the top-k
/// ordering.
pub fn clustered_points(
    count: usize,
    dimension: usize,
    clusters: usize,
    spread: f32,
    seed: u64,
) -> Result<PointSet> {
    if !(spread.is_finite() && spread >= 0.0) {
        return Err(KnnError::InvalidConfig(format!(
            "cluster spread must be finite and non-negative, got {spread}"
        )));
    }
    let noise = Normal::new(0.0f32, spread)
        .map_err(|e| KnnError::InvalidConfig(format!("cluster spread {spread}: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let clusters = clusters.max(1);
    let centers: Vec<f32> = (0..clusters * dimension)
        .map(|_| rng.gen_range(-10.0f32..10.0))
        .collect();

    let mut data = Vec::with_capacity(count * dimension);
    for _ in 0..count {
        let center = rng.gen_range(0..clusters) * dimension;
        for d in 0..dimension {
            data.push(centers[center + d] + noise.sample(&mut rng));
        }
    }
    PointSet::new(dimension, data)
}

/// Exact kNN in double precision.
///
/// For every query, returns `(reference index, distance)` pairs sorted by
/// distance, ties broken by the lower index.
pub fn brute_force_knn(
    reference: &PointSet,
    query: &PointSet,
    k: usize,
) -> Vec<Vec<(usize, f64)>> {
    query
        .iter()
        .map(|q| {
            let mut all: Vec<(usize, f64)> = reference
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let squared: f64 = q
                        .iter()
                        .zip(r)
                        .map(|(&a, &b)| {
                            let diff = a as f64 - b as f64;
                            diff * diff
                        })
                        .sum();
                    (i, squared.sqrt())
                })
                .collect();
            all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            all.truncate(k);
            all
        })
        .collect()
}
