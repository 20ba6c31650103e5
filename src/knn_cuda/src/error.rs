//! Error types for kNN search.

use std::fmt;

use thiserror::Error;

/// Pipeline stage that reported a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Upload,
    ReferenceNorm,
    QueryNorm,
    CrossTerm,
    ReferenceNormAdd,
    TopK,
    QueryNormSqrt,
    Download,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Upload => "upload",
            Stage::ReferenceNorm => "reference norm",
            Stage::QueryNorm => "query norm",
            Stage::CrossTerm => "cross term",
            Stage::ReferenceNormAdd => "reference norm add",
            Stage::TopK => "top-k selection",
            Stage::QueryNormSqrt => "query norm + sqrt",
            Stage::Download => "download",
        };
        f.write_str(name)
    }
}

/// Errors from kNN search.
///
/// Every variant is fatal for the `search` call that produced it.
#[derive(Error, Debug)]
pub enum KnnError {
    /// The budget cannot hold the reference set plus one batch of 16 queries.
    #[error(
        "problem too large for available device memory: need at least {requested_bytes} bytes, \
         {usable_bytes} bytes usable"
    )]
    InsufficientMemory {
        requested_bytes: u64,
        usable_bytes: u64,
    },

    #[error("device allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: u64 },

    #[error("{stage} stage failed: {message}")]
    KernelFault { stage: Stage, message: String },

    #[error("reference dimension {reference} does not match query dimension {query}")]
    DimensionMismatch { reference: usize, query: usize },

    #[error("k = {k} is invalid for {reference_count} reference points (need 1 <= k <= count)")]
    InvalidK { k: usize, reference_count: usize },

    #[error("point dimension must be at least 1")]
    InvalidDimension,

    #[error("{len} coordinates cannot be split into points of dimension {dimension}")]
    MalformedPointSet { len: usize, dimension: usize },

    #[error("{count} points exceed the per-axis device limit of {limit}")]
    TooManyPoints { count: usize, limit: usize },

    #[error("invalid search configuration: {0}")]
    InvalidConfig(String),

    #[error("device error: {0}")]
    Device(String),
}

impl KnnError {
    pub(crate) fn fault(stage: Stage, message: impl Into<String>) -> Self {
        KnnError::KernelFault {
            stage,
            message: message.into(),
        }
    }

    /// True for capacity errors (planning or allocation).
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            KnnError::InsufficientMemory { .. } | KnnError::OutOfMemory { .. }
        )
    }

    /// True for errors the caller could have avoided by checking its inputs.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            KnnError::DimensionMismatch { .. }
                | KnnError::InvalidK { .. }
                | KnnError::InvalidDimension
                | KnnError::MalformedPointSet { .. }
                | KnnError::TooManyPoints { .. }
                | KnnError::InvalidConfig(_)
        )
    }
}

/// Result type for kNN operations.
pub type Result<T> = std::result::Result<T, KnnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_messages_carry_byte_sizes() {
        let err = KnnError::OutOfMemory { bytes: 4096 };
        assert!(err.to_string().contains("4096"));
        assert!(err.is_capacity_error());

        let err = KnnError::InsufficientMemory {
            requested_bytes: 1000,
            usable_bytes: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("1000") && msg.contains("10"));
    }

    #[test]
    fn test_fault_names_stage() {
        let err = KnnError::fault(Stage::TopK, "illegal address");
        assert_eq!(err.to_string(), "top-k selection stage failed: illegal address");
        assert!(!err.is_capacity_error());
        assert!(!err.is_precondition_violation());
    }
}
