//! Host-side point sets and search results.
//!
//! Both are column-major: a point set of dimension `D` stores point `p` at
//! `data[p * D..(p + 1) * D]`, and a result stores the `k` neighbors of query `q`
//! at `distances[q * k..(q + 1) * k]`.

use serde::{Deserialize, Serialize};

use crate::error::{KnnError, Result};
use crate::timing::SearchTiming;

/// Dense set of `count` points of a fixed `dimension`.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSet {
    dimension: usize,
    data: Vec<f32>,
}

impl PointSet {
    /// Wrap column-major coordinates (one point after another).
    pub fn new(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 {
            return Err(KnnError::InvalidDimension);
        }
        if data.len() % dimension != 0 {
            return Err(KnnError::MalformedPointSet {
                len: data.len(),
                dimension,
            });
        }
        Ok(Self { dimension, data })
    }

    /// Build from fixed-size points.
    pub fn from_points<const D: usize>(points: &[[f32; D]]) -> Result<Self> {
        let data = points.iter().flat_map(|p| p.iter().copied()).collect();
        Self::new(D, data)
    }

    /// Build from variable-length rows, all of which must share one length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dimension = rows.first().map(Vec::len).ok_or(KnnError::InvalidDimension)?;
        let mut data = Vec::with_capacity(rows.len() * dimension);
        for row in rows {
            if row.len() != dimension {
                return Err(KnnError::DimensionMismatch {
                    reference: dimension,
                    query: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(dimension, data)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Coordinates of point `index`.
    pub fn point(&self, index: usize) -> &[f32] {
        let start = index * self.dimension;
        &self.data[start..start + self.dimension]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Lay out columns `[start, start + count)` as `dimension` rows of `pitch` floats,
    /// i.e. coordinate `d` of point `start + c` lands at `d * pitch + c`.
    ///
    /// Padding columns are zero.
    pub(crate) fn to_pitched_rows(&self, start: usize, count: usize, pitch: usize) -> Vec<f32> {
        debug_assert!(count <= pitch);
        let mut rows = vec![0.0f32; self.dimension * pitch];
        for c in 0..count {
            for (d, &value) in self.point(start + c).iter().enumerate() {
                rows[d * pitch + c] = value;
            }
        }
        rows
    }
}

/// One selected neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// 0-based index into the reference set.
    pub index: usize,
    /// Euclidean distance.
    pub distance: f32,
}

/// Result of a kNN search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnResult {
    pub k: usize,
    pub query_count: usize,
    /// `k × query_count`, column-major, ascending within each query.
    pub distances: Vec<f32>,
    /// 0-based reference indices, parallel to `distances`.
    pub indices: Vec<usize>,
    /// Queries processed per batch.
    pub batch_size: usize,
    /// Number of batches the query set was split into.
    pub batch_count: usize,
    /// Name of the backend that ran the search.
    pub backend: String,
    pub timing: SearchTiming,
}

impl KnnResult {
    pub(crate) fn empty(k: usize, backend: &str) -> Self {
        Self {
            k,
            query_count: 0,
            distances: Vec::new(),
            indices: Vec::new(),
            batch_size: 0,
            batch_count: 0,
            backend: backend.to_string(),
            timing: SearchTiming::default(),
        }
    }

    pub fn distances_for(&self, query: usize) -> &[f32] {
        &self.distances[query * self.k..(query + 1) * self.k]
    }

    pub fn indices_for(&self, query: usize) -> &[usize] {
        &self.indices[query * self.k..(query + 1) * self.k]
    }

    pub fn neighbors(&self, query: usize) -> Vec<Neighbor> {
        self.indices_for(query)
            .iter()
            .zip(self.distances_for(query))
            .map(|(&index, &distance)| Neighbor { index, distance })
            .collect()
    }
}
