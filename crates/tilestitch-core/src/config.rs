//! Configuration of a global optimization run.
//!
//! [`SelectionConfig`] is the contract with the calling UI: which views are
//! in scope and which role each classification axis plays.
//! [`OptimizerConfig`] selects the numerical method. Both are plain data
//! with serde derives and an explicit `validate()`, so an invalid
//! configuration is rejected before any computation starts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::aggregate::GroupAggregator;
use crate::placement::ViewRegistrations;
use crate::types::ConfigError;
use crate::view::{Axis, View, ViewCatalog};

/// Which views are optimized and how their axes are treated.
///
/// Views that agree on every axis that is neither a grouping nor an
/// application axis form one node. Comparison axes are the axes nodes may
/// differ along and still be linked; nodes differing along any other axis
/// are never linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Views in scope.
    pub views: BTreeSet<View>,

    /// Axes merged into one node (e.g. channel and illumination).
    #[serde(default)]
    pub grouping: BTreeSet<Axis>,

    /// Axes compared against each other to form edges (e.g. tile).
    #[serde(default)]
    pub comparison: BTreeSet<Axis>,

    /// Axes the computed correction is replicated across unchanged
    /// (e.g. timepoint).
    #[serde(default)]
    pub application: BTreeSet<Axis>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            views: BTreeSet::new(),
            grouping: BTreeSet::new(),
            comparison: BTreeSet::from([Axis::Tile]),
            application: BTreeSet::new(),
        }
    }
}

impl SelectionConfig {
    /// Compare tiles of the given views, with no grouping or application
    /// axes.
    #[must_use]
    pub fn new(views: impl IntoIterator<Item = View>) -> Self {
        Self {
            views: views.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Replace the grouping axes.
    #[must_use]
    pub fn with_grouping(mut self, axes: impl IntoIterator<Item = Axis>) -> Self {
        self.grouping = axes.into_iter().collect();
        self
    }

    /// Replace the comparison axes.
    #[must_use]
    pub fn with_comparison(mut self, axes: impl IntoIterator<Item = Axis>) -> Self {
        self.comparison = axes.into_iter().collect();
        self
    }

    /// Replace the application axes.
    #[must_use]
    pub fn with_application(mut self, axes: impl IntoIterator<Item = Axis>) -> Self {
        self.application = axes.into_iter().collect();
        self
    }

    /// Whether `axis` distinguishes nodes (neither grouping nor application).
    #[must_use]
    pub fn is_node_axis(&self, axis: Axis) -> bool {
        !self.grouping.contains(&axis) && !self.application.contains(&axis)
    }

    /// Check that no axis has more than one role.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ContradictoryAxis`] for the first axis (in
    /// [`Axis`] order) assigned to two roles.
    pub fn validate_roles(&self) -> Result<(), ConfigError> {
        for axis in Axis::ALL {
            let roles: Vec<&'static str> = [
                ("grouping", &self.grouping),
                ("comparison", &self.comparison),
                ("application", &self.application),
            ]
            .into_iter()
            .filter(|(_, axes)| axes.contains(&axis))
            .map(|(name, _)| name)
            .collect();
            if let [first, second, ..] = roles[..] {
                return Err(ConfigError::ContradictoryAxis {
                    axis,
                    first,
                    second,
                });
            }
        }
        Ok(())
    }

    /// Full validation against the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptySelection`] if no views are selected,
    /// [`ConfigError::ContradictoryAxis`] (see
    /// [`validate_roles`](Self::validate_roles)), and
    /// [`ConfigError::UnknownView`] / [`ConfigError::MissingRegistration`]
    /// for the first selected view missing from `catalog` /
    /// `registrations`.
    pub fn validate(
        &self,
        catalog: &ViewCatalog,
        registrations: &ViewRegistrations,
    ) -> Result<(), ConfigError> {
        if self.views.is_empty() {
            return Err(ConfigError::EmptySelection);
        }
        self.validate_roles()?;
        if let Some(view) = self.views.iter().find(|v| !catalog.contains(v)) {
            return Err(ConfigError::UnknownView(*view));
        }
        let registered = registrations.views();
        if let Some(view) = self.views.iter().find(|v| !registered.contains(v)) {
            return Err(ConfigError::MissingRegistration(*view));
        }
        Ok(())
    }
}

/// How much each link counts in the least-squares objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EdgeWeighting {
    /// Every link has weight 1.
    Uniform,
    /// Weight is the link's correlation, floored at `min_weight`.
    Correlation {
        /// Lower bound on any weight. Must be positive.
        min_weight: f64,
    },
}

impl Default for EdgeWeighting {
    fn default() -> Self {
        Self::Correlation { min_weight: 0.01 }
    }
}

impl EdgeWeighting {
    /// Weight of a link with correlation `r`.
    #[must_use]
    pub const fn weight(self, r: f64) -> f64 {
        match self {
            Self::Uniform => 1.0,
            Self::Correlation { min_weight } => r.max(min_weight),
        }
    }
}

/// Which linear solver places the nodes of a component.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum SolverKind {
    /// Cholesky factorization of the normal equations.
    #[default]
    Direct,

    /// Gauss-Seidel relaxation starting from the current placements.
    ///
    /// Slower to converge than [`Direct`](Self::Direct) on long chains but
    /// never forms the dense normal matrix.
    Relaxation {
        /// Iteration budget per solve.
        max_iterations: usize,
        /// Converged once the largest per-node update is below this.
        tolerance: f64,
    },
}

/// Iterative removal of links that disagree with the solved placement.
///
/// After a component is solved, its worst link is dropped if its residual
/// exceeds both `absolute_threshold` and `relative_threshold` times the
/// component's mean residual; the component is then re-solved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkPruning {
    /// Ratio of worst to mean residual that triggers a drop.
    pub relative_threshold: f64,
    /// Residual (in global units) below which no link is dropped.
    pub absolute_threshold: f64,
    /// Maximum number of links dropped per component.
    pub max_rounds: usize,
}

impl Default for LinkPruning {
    fn default() -> Self {
        Self {
            relative_threshold: 2.5,
            absolute_threshold: 3.5,
            max_rounds: 10,
        }
    }
}

/// Numerical settings of the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Linear solver.
    #[serde(default)]
    pub solver: SolverKind,
    /// Link weighting.
    #[serde(default)]
    pub weighting: EdgeWeighting,
    /// Iterative link pruning; `None` keeps every link.
    #[serde(default)]
    pub pruning: Option<LinkPruning>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            solver: SolverKind::default(),
            weighting: EdgeWeighting::default(),
            pruning: Some(LinkPruning::default()),
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

impl OptimizerConfig {
    /// Check numeric parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParameter`] for a non-positive or
    /// non-finite weight floor, tolerance or threshold, or a zero iteration
    /// budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let EdgeWeighting::Correlation { min_weight } = self.weighting {
            positive("min_weight", min_weight)?;
        }
        if let SolverKind::Relaxation {
            max_iterations,
            tolerance,
        } = self.solver
        {
            if max_iterations == 0 {
                return Err(ConfigError::InvalidParameter(
                    "max_iterations must be at least 1".to_owned(),
                ));
            }
            positive("tolerance", tolerance)?;
        }
        if let Some(pruning) = self.pruning {
            positive("relative_threshold", pruning.relative_threshold)?;
            positive("absolute_threshold", pruning.absolute_threshold)?;
        }
        Ok(())
    }
}

/// Everything a global optimization run needs besides the dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalOptConfig {
    /// Views and axis roles.
    pub selection: SelectionConfig,
    /// Numerical settings.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// How each node's reference group is resolved to a placement.
    #[serde(default)]
    pub aggregation: GroupAggregator,
}

impl GlobalOptConfig {
    /// Default optimizer settings for `selection`.
    #[must_use]
    pub fn new(selection: SelectionConfig) -> Self {
        Self {
            selection,
            ..Self::default()
        }
    }

    /// Validate the selection against the dataset and the optimizer
    /// parameters.
    ///
    /// # Errors
    ///
    /// See [`SelectionConfig::validate`] and [`OptimizerConfig::validate`].
    pub fn validate(
        &self,
        catalog: &ViewCatalog,
        registrations: &ViewRegistrations,
    ) -> Result<(), ConfigError> {
        self.selection.validate(catalog, registrations)?;
        self.optimizer.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::placement::TransformChain;
    use crate::view::ViewAttributes;

    fn dataset() -> (ViewCatalog, ViewRegistrations) {
        let catalog: ViewCatalog = (0..2)
            .map(|t| (View::new(0, t), ViewAttributes::tile(t)))
            .collect();
        let registrations = ViewRegistrations::new();
        for view in catalog.views() {
            registrations.insert(*view, TransformChain::new());
        }
        (catalog, registrations)
    }

    #[test]
    fn empty_selection_is_rejected() {
        let (catalog, registrations) = dataset();
        let err = SelectionConfig::new(Vec::<View>::new())
            .validate(&catalog, &registrations)
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptySelection);
    }

    #[test]
    fn axis_with_two_roles_is_rejected() {
        let selection = SelectionConfig::new([View::new(0, 0)])
            .with_grouping([Axis::Channel, Axis::Tile])
            .with_comparison([Axis::Tile]);
        assert_eq!(
            selection.validate_roles().unwrap_err(),
            ConfigError::ContradictoryAxis {
                axis: Axis::Tile,
                first: "grouping",
                second: "comparison",
            }
        );
    }

    #[test]
    fn unknown_and_unregistered_views_are_rejected() {
        let (catalog, registrations) = dataset();
        let err = SelectionConfig::new([View::new(0, 0), View::new(0, 5)])
            .validate(&catalog, &registrations)
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownView(View::new(0, 5)));

        let mut catalog = catalog;
        catalog.insert(View::new(0, 5), ViewAttributes::tile(5));
        let err = SelectionConfig::new([View::new(0, 5)])
            .validate(&catalog, &registrations)
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingRegistration(View::new(0, 5)));
    }

    #[test]
    fn defaults() {
        let config = OptimizerConfig::default();
        assert_eq!(config.solver, SolverKind::Direct);
        assert_eq!(config.weighting, EdgeWeighting::Correlation { min_weight: 0.01 });
        let pruning = config.pruning.unwrap();
        assert!((pruning.relative_threshold - 2.5).abs() < f64::EPSILON);
        assert!((pruning.absolute_threshold - 3.5).abs() < f64::EPSILON);
        assert_eq!(pruning.max_rounds, 10);
        config.validate().unwrap();
    }

    #[test]
    fn correlation_weight_is_monotone_and_floored() {
        let weighting = EdgeWeighting::default();
        assert!((weighting.weight(-0.3) - 0.01).abs() < f64::EPSILON);
        assert!(weighting.weight(0.4) < weighting.weight(0.9));
        assert!((EdgeWeighting::Uniform.weight(0.2) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let config = OptimizerConfig {
            solver: SolverKind::Relaxation {
                max_iterations: 0,
                tolerance: 1e-6,
            },
            ..OptimizerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidParameter(_))));

        let config = OptimizerConfig {
            weighting: EdgeWeighting::Correlation { min_weight: 0.0 },
            ..OptimizerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidParameter(_))));
    }

    #[test]
    fn config_serde_round_trip() {
        let config = GlobalOptConfig {
            selection: SelectionConfig::new([View::new(0, 0), View::new(1, 0)])
                .with_application([Axis::Timepoint]),
            optimizer: OptimizerConfig {
                solver: SolverKind::Relaxation {
                    max_iterations: 500,
                    tolerance: 1e-9,
                },
                weighting: EdgeWeighting::Uniform,
                pruning: None,
            },
            aggregation: GroupAggregator::new(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: GlobalOptConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
