//! Error types shared across the stitching core.
//!
//! Errors are split by the layer that raises them so callers can tell a
//! configuration mistake (reported before any work starts) apart from a
//! numerical failure (reported after the solver ran) or a concurrency
//! conflict.

use crate::view::{Axis, Group, View};

/// Errors constructing the core data model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StitchError {
    /// A group must contain at least one view.
    #[error("a group must contain at least one view")]
    EmptyGroup,

    /// Both endpoints of a pair are the same group.
    #[error("pairwise result links group {0} to itself")]
    SelfLoop(Group),

    /// The measured transform is singular or contains non-finite values.
    #[error("pairwise transform between {a} and {b} is not invertible")]
    NonInvertibleTransform {
        /// First group of the pair.
        a: Group,
        /// Second group of the pair.
        b: Group,
    },

    /// The correlation score is NaN or infinite.
    #[error("correlation {0} is not a finite number")]
    NonFiniteCorrelation(f64),
}

/// Errors constructing a result filter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// The lower correlation bound exceeds the upper one.
    #[error("correlation range is empty: min {min} > max {max}")]
    EmptyCorrelationRange {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// A shift bound is negative or NaN.
    #[error("shift bound must be a non-negative number, got {0}")]
    InvalidShiftBound(f64),

    /// A correlation bound is NaN.
    #[error("correlation bound must not be NaN")]
    NanCorrelationBound,
}

/// Errors resolving a group to its representative views.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    /// A view has no entry in the catalog.
    #[error("view {0} has no classification metadata")]
    MissingMetadata(View),

    /// A `PickBest` policy needs an image the caller did not supply.
    #[error("view {view} has no image to score along the {axis} axis")]
    MissingImage {
        /// View without an image.
        view: View,
        /// Axis whose policy needed the score.
        axis: Axis,
    },

    /// A representative view has no image to average.
    #[error("view {0} has no image to aggregate")]
    ImageUnavailable(View),

    /// Images to be averaged have different dimensions.
    #[error("image of view {view} is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        /// Offending view.
        view: View,
        /// Dimensions of the first resolved image.
        expected: (u32, u32),
        /// Dimensions of the offending image.
        actual: (u32, u32),
    },

    /// A view has no transform chain.
    #[error("view {0} has no registration")]
    MissingRegistration(View),
}

/// Errors in an optimizer selection configuration.
///
/// All of these are detected before any computation starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No views are selected.
    #[error("no views selected for optimization")]
    EmptySelection,

    /// One axis was given more than one role.
    #[error("axis {axis} is assigned both as {first} and as {second}")]
    ContradictoryAxis {
        /// The offending axis.
        axis: Axis,
        /// First role.
        first: &'static str,
        /// Second role.
        second: &'static str,
    },

    /// A selected view is unknown to the catalog.
    #[error("selected view {0} is not in the view catalog")]
    UnknownView(View),

    /// A selected view has no transform chain.
    #[error("selected view {0} has no registration")]
    MissingRegistration(View),

    /// A numeric optimizer parameter is out of range.
    #[error("invalid optimizer parameter: {0}")]
    InvalidParameter(String),
}

/// Numerical failures of the global solver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolveError {
    /// The normal equations of a component are singular.
    #[error("component {component} is singular")]
    Singular {
        /// Index of the failing component.
        component: usize,
    },

    /// Iterative relaxation did not converge.
    #[error("component {component} did not converge after {iterations} iterations (last update {last_update:.3e})")]
    NotConverged {
        /// Index of the failing component.
        component: usize,
        /// Iterations performed.
        iterations: usize,
        /// Largest position update in the final iteration.
        last_update: f64,
    },

    /// The solution contains non-finite values.
    #[error("component {component} produced a non-finite placement")]
    NonFinite {
        /// Index of the failing component.
        component: usize,
    },

    /// The run was cancelled.
    #[error("optimization cancelled")]
    Cancelled,
}

/// Errors of a global optimization run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizeError {
    /// The selection or optimizer configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Another optimization is already running on this dataset.
    #[error("a global optimization is already running on this dataset")]
    AlreadyRunning,

    /// A node could not be resolved to a current placement.
    #[error("could not resolve node placement: {0}")]
    Aggregation(#[from] AggregateError),

    /// The solver failed; nothing was committed.
    #[error("numerical failure: {0}")]
    Numerical(SolveError),

    /// The run was cancelled; nothing was committed.
    #[error("optimization cancelled")]
    Cancelled,

    /// The background worker panicked.
    #[error("optimization worker terminated abnormally")]
    WorkerPanicked,
}

impl From<SolveError> for OptimizeError {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::Cancelled => Self::Cancelled,
            other => Self::Numerical(other),
        }
    }
}
