//! Global optimization: from filtered pairwise results to committed
//! per-view placements.
//!
//! A run validates its configuration, partitions the selection into nodes,
//! resolves each node's current placement, turns the filtered registry into
//! edges, solves every connected component, and finally writes one
//! correction per view in a single atomic commit. Any failure before the
//! commit leaves the transform chains untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nalgebra::Vector3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::GlobalOptConfig;
use crate::context::{CancelToken, StitchingContext};
use crate::diagnostics::{OptimizationDiagnostics, StageTimer};
use crate::filter::FilterSet;
use crate::grouping::{NodeGraph, NodeId, SkippedLink};
use crate::pairwise::PairKey;
use crate::solver::{self, ComponentReport, PrunedLink};
use crate::transform::AffineTransform;
use crate::types::{ConfigError, OptimizeError};
use crate::view::View;

/// Lifecycle of an optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Built, not started.
    Configured,
    /// A run is in progress.
    Running,
    /// The last run committed (or had nothing to commit).
    Succeeded,
    /// The last run failed; nothing was committed.
    Failed,
    /// The last run was cancelled; nothing was committed.
    Cancelled,
}

impl RunState {
    /// Whether a run has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn of<T>(result: &Result<T, OptimizeError>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(OptimizeError::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

/// The correction applied to every view of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCorrection {
    /// The node.
    pub node: NodeId,
    /// Every view that received the correction.
    pub views: Vec<View>,
    /// Solved position minus previous position.
    pub translation: Vector3<f64>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Nodes in the selection.
    pub node_count: usize,
    /// Registry entries used as edges, before pruning.
    pub links: Vec<PairKey>,
    /// Registry entries touching the selection that were not used.
    pub skipped: Vec<SkippedLink>,
    /// Edges dropped by pruning.
    pub pruned: Vec<PrunedLink>,
    /// One summary per multi-node component.
    pub components: Vec<ComponentReport>,
    /// Corrections written, one per node of a multi-node component.
    pub corrections: Vec<NodeCorrection>,
    /// Stage timings and counts.
    pub diagnostics: OptimizationDiagnostics,
}

impl OptimizationReport {
    /// Whether the run changed any transform chain.
    #[must_use]
    pub fn committed(&self) -> bool {
        !self.corrections.is_empty()
    }

    /// Largest correction magnitude.
    #[must_use]
    pub fn max_correction(&self) -> f64 {
        self.corrections
            .iter()
            .map(|c| c.translation.norm())
            .fold(0.0, f64::max)
    }
}

/// One configured global optimization over a dataset.
///
/// At most one run executes over a set of transform chains at a time,
/// whether started through [`run`](Self::run) or [`spawn`](Self::spawn).
///
/// Clones share the lifecycle state and the armed cancel token. Every
/// invocation consumes the armed token and arms a fresh one when it ends,
/// so a cancellation only ever stops the run it was aimed at.
#[derive(Debug, Clone)]
pub struct GlobalOptimizer {
    context: StitchingContext,
    config: GlobalOptConfig,
    filters: FilterSet,
    state: Arc<Mutex<RunState>>,
    cancel: Arc<Mutex<CancelToken>>,
}

impl GlobalOptimizer {
    /// An optimizer using every registry entry.
    #[must_use]
    pub fn new(context: StitchingContext, config: GlobalOptConfig) -> Self {
        Self {
            context,
            config,
            filters: FilterSet::new(),
            state: Arc::new(Mutex::new(RunState::Configured)),
            cancel: Arc::new(Mutex::new(CancelToken::new())),
        }
    }

    /// Only use registry entries passing `filters`.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &GlobalOptConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// A token that cancels the active run, or the next one if none is
    /// active. Tokens taken before a run ended have no effect on later runs.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.lock().clone()
    }

    /// Record the outcome of a run and arm a fresh token for the next.
    fn finish(&self, result: &Result<OptimizationReport, OptimizeError>) {
        *self.cancel.lock() = CancelToken::new();
        *self.state.lock() = RunState::of(result);
    }

    /// Run to completion on the calling thread.
    ///
    /// # Errors
    ///
    /// - [`OptimizeError::AlreadyRunning`] if another run holds the
    ///   dataset; the state is left unchanged.
    /// - [`OptimizeError::Config`] for an invalid configuration, before any
    ///   computation.
    /// - [`OptimizeError::Aggregation`] if a node placement cannot be
    ///   resolved.
    /// - [`OptimizeError::Numerical`] if any component fails to solve.
    /// - [`OptimizeError::Cancelled`] if the cancel token fired.
    ///
    /// In every error case the transform chains are untouched.
    pub fn run(&self) -> Result<OptimizationReport, OptimizeError> {
        let _guard = self.context.begin_run()?;
        let cancel = self.cancel_token();
        *self.state.lock() = RunState::Running;
        let result = self.execute(&cancel);
        self.finish(&result);
        result
    }

    /// Run on a background thread.
    ///
    /// The run guard is taken before this returns, so a concurrent second
    /// request is rejected synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizeError::AlreadyRunning`] if another run holds the
    /// dataset.
    pub fn spawn(self) -> Result<OptimizationHandle, OptimizeError> {
        let guard = self.context.begin_run()?;
        let cancel = self.cancel_token();
        *self.state.lock() = RunState::Running;
        let state = Arc::clone(&self.state);
        let worker_cancel = cancel.clone();
        let thread = thread::spawn(move || {
            let _guard = guard;
            let result = self.execute(&worker_cancel);
            self.finish(&result);
            result
        });
        Ok(OptimizationHandle {
            state,
            cancel,
            thread,
        })
    }

    fn execute(&self, cancel: &CancelToken) -> Result<OptimizationReport, OptimizeError> {
        let result = self.execute_stages(cancel);
        match &result {
            Ok(report) => tracing::info!(
                nodes = report.node_count,
                components = report.components.len(),
                corrections = report.corrections.len(),
                max_correction = report.max_correction(),
                "global optimization finished"
            ),
            Err(OptimizeError::Cancelled) => tracing::info!("global optimization cancelled"),
            Err(err) => tracing::warn!(%err, "global optimization failed"),
        }
        result
    }

    fn execute_stages(&self, cancel: &CancelToken) -> Result<OptimizationReport, OptimizeError> {
        let context = &self.context;
        let selection = &self.config.selection;
        self.config
            .validate(context.catalog(), context.registrations())?;

        let mut timer = StageTimer::start();
        let mut diagnostics = OptimizationDiagnostics::default();

        let graph = NodeGraph::build(selection, context.catalog())?;
        if graph.is_empty() {
            return Err(ConfigError::EmptySelection.into());
        }
        tracing::info!(
            views = selection.views.len(),
            nodes = graph.len(),
            "starting global optimization"
        );
        let placements = graph
            .nodes()
            .iter()
            .map(|node| {
                self.config
                    .aggregation
                    .aggregate_transform(
                        node.reference(),
                        context.registrations(),
                        context.images(),
                        context.catalog(),
                    )
                    .map(|t| t.translation)
            })
            .collect::<Result<Vec<_>, _>>()?;
        diagnostics.node_building = timer.lap();
        diagnostics.node_count = graph.len();

        if graph.len() == 1 {
            tracing::info!("single node selected, nothing to optimize");
            diagnostics.total = timer.total();
            return Ok(OptimizationReport {
                node_count: 1,
                diagnostics,
                ..OptimizationReport::default()
            });
        }

        let results = context.pipeline(self.filters.clone()).filtered_results();
        let edge_set = graph.edges(results.values());
        diagnostics.edge_building = timer.lap();
        diagnostics.edge_count = edge_set.edges.len();
        diagnostics.skipped_count = edge_set.skipped.len();

        cancel.check()?;
        let solution = solver::solve(
            &placements,
            &edge_set.edges,
            &self.config.optimizer,
            cancel,
        )?;
        diagnostics.solve = timer.lap();
        diagnostics.pruned_count = solution.pruned.len();
        diagnostics.component_count = solution.components.len();

        let mut corrections = Vec::new();
        let mut per_view = BTreeMap::new();
        for component in &solution.components {
            for &id in &component.nodes {
                let Some(node) = graph.node(id) else {
                    continue;
                };
                let translation = solution.positions[id.0] - placements[id.0];
                for view in node.views() {
                    per_view.insert(*view, AffineTransform::from_translation(translation));
                }
                corrections.push(NodeCorrection {
                    node: id,
                    views: node.views().iter().copied().collect(),
                    translation,
                });
            }
        }

        cancel.check()?;
        context.registrations().commit(&per_view)?;
        diagnostics.commit = timer.lap();
        diagnostics.total = timer.total();

        Ok(OptimizationReport {
            node_count: graph.len(),
            links: edge_set.edges.iter().map(|e| e.key.clone()).collect(),
            skipped: edge_set.skipped,
            pruned: solution.pruned,
            components: solution.components,
            corrections,
            diagnostics,
        })
    }
}

/// A run executing on a background thread.
#[derive(Debug)]
pub struct OptimizationHandle {
    state: Arc<Mutex<RunState>>,
    cancel: CancelToken,
    thread: JoinHandle<Result<OptimizationReport, OptimizeError>>,
}

impl OptimizationHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Request cancellation. The run stops at its next checkpoint and
    /// commits nothing, unless it has already committed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run to end.
    ///
    /// # Errors
    ///
    /// The run's own error, or [`OptimizeError::WorkerPanicked`] if the
    /// worker thread panicked.
    pub fn join(self) -> Result<OptimizationReport, OptimizeError> {
        self.thread.join().unwrap_or_else(|_| {
            *self.state.lock() = RunState::Failed;
            Err(OptimizeError::WorkerPanicked)
        })
    }
}
