//! Error types for the path engine.
//!
//! Control outcomes of the optimizer (convergence, regeneration requests and the
//! iteration cap) are reported through [`crate::optimizer::StepStatus`] and are
//! not errors. Everything in [`PathError`] aborts the current operation.

use crate::oracle::OracleError;
use crate::settings::ConfigError;
use thiserror::Error;

/// Failures raised by chain construction, interpolation, constraint handling and
/// TS estimation.
#[derive(Error, Debug)]
pub enum PathError {
    /// Fewer nodes than the operation needs.
    #[error("invalid path size: got {found} nodes, need at least {minimum}")]
    InvalidPathSize {
        /// Number of nodes supplied
        found: usize,
        /// Minimum number of nodes accepted
        minimum: usize,
    },
    /// Vectors of inconsistent length were mixed.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected length
        expected: usize,
        /// Length actually found
        found: usize,
    },
    /// Two adjacent nodes coincide, so the segment between them has no direction.
    #[error("zero-length segment between nodes {index} and {}", index + 1)]
    DegenerateSegment {
        /// Index of the first node of the segment
        index: usize,
    },
    /// The Lagrange multiplier system has no unique solution.
    #[error("constraint system is singular")]
    ConstraintSingular,
    /// The interpolation system could not be solved.
    #[error("interpolation failed: {0}")]
    Interpolation(String),
    /// An estimator that needs per-bead gradients was given none.
    #[error("gradients are required for this operation")]
    MissingGradients,
    /// A node has no cached energy where one is required.
    #[error("energy missing for node {0}")]
    MissingEnergies(usize),
    /// The pseudo-time integrator could not reach the target time.
    #[error("integration failed: {0}")]
    Integration(String),
    /// The energy/gradient oracle reported a fault.
    #[error("oracle failure: {0}")]
    Oracle(#[from] OracleError),
    /// The configuration was rejected before the search started.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, PathError>;
