//! tilestitch-core: Stitching consistency core (sans-IO).
//!
//! Takes pairwise measurements between groups of views (a transform plus a
//! correlation score, produced elsewhere by image correlation) and turns
//! them into one consistent placement per view:
//! registry -> filtering -> grouping/aggregation -> global optimization ->
//! commit to the per-view transform chains.
//!
//! This crate performs **no I/O**. Images, metadata and transform chains
//! are supplied in memory through a [`StitchingContext`]; loading and
//! saving datasets is the caller's concern.
//!
//! Logging goes through the `tracing` facade; no subscriber is installed
//! here.

pub mod aggregate;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod filter;
pub mod grouping;
pub mod optimize;
pub mod pairwise;
pub mod placement;
pub mod registry;
pub mod solver;
pub mod transform;
pub mod types;
pub mod view;

pub use aggregate::{AggregationPolicy, GroupAggregator, Score, ViewImages};
pub use config::{
    EdgeWeighting, GlobalOptConfig, LinkPruning, OptimizerConfig, SelectionConfig, SolverKind,
};
pub use context::{CancelToken, StitchingContext};
pub use diagnostics::OptimizationDiagnostics;
pub use filter::{FilterKind, FilterPipeline, FilterSet, ResultFilter, ResultPredicate};
pub use grouping::{NodeGraph, NodeId, SkipReason, SkippedLink, candidate_pairs};
pub use optimize::{
    GlobalOptimizer, NodeCorrection, OptimizationHandle, OptimizationReport, RunState,
};
pub use pairwise::{BoundingBox, MeasurementMethod, PairKey, PairwiseResult};
pub use placement::{STITCHING, TransformChain, ViewRegistrations, link_residual};
pub use registry::{ErrorStatistics, ResultRegistry};
pub use solver::{ComponentReport, PrunedLink};
pub use transform::AffineTransform;
pub use types::{
    AggregateError, ConfigError, FilterError, OptimizeError, SolveError, StitchError,
};
pub use view::{Axis, Group, View, ViewAttributes, ViewCatalog};
