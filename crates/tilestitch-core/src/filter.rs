//! Non-destructive filtering of the result registry.
//!
//! A [`FilterPipeline`] presents the subset of the registry that passes
//! every active [`ResultFilter`] without touching the registry itself, so
//! thresholds can be tried out freely. Only
//! [`apply_to_subset`](FilterPipeline::apply_to_subset) (and its
//! convenience wrapper [`apply_to_all`](FilterPipeline::apply_to_all))
//! mutate the registry, and only within a caller-supplied candidate set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pairwise::{PairKey, PairwiseResult};
use crate::registry::ResultRegistry;
use crate::types::FilterError;

/// Identifies the concern a filter addresses.
///
/// The pipeline holds at most one filter per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// Correlation range.
    Correlation,
    /// Per-axis absolute shift bound.
    AbsoluteShift,
    /// Shift magnitude bound.
    ShiftMagnitude,
}

/// A built-in predicate over pairwise results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResultFilter {
    /// Keep iff `min <= r <= max`.
    Correlation {
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },
    /// Keep iff `|t[i]| <= max_per_axis[i]` for every axis.
    AbsoluteShift {
        /// Inclusive per-axis bound.
        max_per_axis: [f64; 3],
    },
    /// Keep iff `‖t‖ <= max_magnitude`.
    ShiftMagnitude {
        /// Inclusive bound on the Euclidean norm of the translation.
        max_magnitude: f64,
    },
}

impl ResultFilter {
    /// A correlation range filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::NanCorrelationBound`] if either bound is
    /// NaN, or [`FilterError::EmptyCorrelationRange`] if `min > max`.
    pub fn correlation(min: f64, max: f64) -> Result<Self, FilterError> {
        let filter = Self::Correlation { min, max };
        filter.validate()?;
        Ok(filter)
    }

    /// A per-axis absolute shift filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidShiftBound`] if any bound is
    /// negative or NaN.
    pub fn absolute_shift(max_per_axis: [f64; 3]) -> Result<Self, FilterError> {
        let filter = Self::AbsoluteShift { max_per_axis };
        filter.validate()?;
        Ok(filter)
    }

    /// A shift magnitude filter.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidShiftBound`] if the bound is
    /// negative or NaN.
    pub fn shift_magnitude(max_magnitude: f64) -> Result<Self, FilterError> {
        let filter = Self::ShiftMagnitude { max_magnitude };
        filter.validate()?;
        Ok(filter)
    }

    /// Check the filter parameters.
    ///
    /// Filters deserialized from user input should be validated before
    /// being added to a pipeline.
    ///
    /// # Errors
    ///
    /// See the constructors.
    pub fn validate(&self) -> Result<(), FilterError> {
        match *self {
            Self::Correlation { min, max } => {
                if min.is_nan() || max.is_nan() {
                    return Err(FilterError::NanCorrelationBound);
                }
                if min > max {
                    return Err(FilterError::EmptyCorrelationRange { min, max });
                }
                Ok(())
            }
            Self::AbsoluteShift { max_per_axis } => max_per_axis
                .into_iter()
                .try_for_each(check_shift_bound),
            Self::ShiftMagnitude { max_magnitude } => check_shift_bound(max_magnitude),
        }
    }

    /// The concern this filter addresses.
    #[must_use]
    pub const fn kind(&self) -> FilterKind {
        match self {
            Self::Correlation { .. } => FilterKind::Correlation,
            Self::AbsoluteShift { .. } => FilterKind::AbsoluteShift,
            Self::ShiftMagnitude { .. } => FilterKind::ShiftMagnitude,
        }
    }
}

fn check_shift_bound(bound: f64) -> Result<(), FilterError> {
    if bound.is_nan() || bound < 0.0 {
        Err(FilterError::InvalidShiftBound(bound))
    } else {
        Ok(())
    }
}

/// A pure predicate deciding whether a pairwise result is kept.
pub trait ResultPredicate {
    /// `true` if `result` passes.
    fn keep(&self, result: &PairwiseResult) -> bool;
}

impl ResultPredicate for ResultFilter {
    fn keep(&self, result: &PairwiseResult) -> bool {
        match *self {
            Self::Correlation { min, max } => {
                let r = result.correlation();
                min <= r && r <= max
            }
            Self::AbsoluteShift { max_per_axis } => result
                .shift()
                .iter()
                .zip(max_per_axis)
                .all(|(t, bound)| t.abs() <= bound),
            Self::ShiftMagnitude { max_magnitude } => result.shift().norm() <= max_magnitude,
        }
    }
}

/// Conjunction of at most one filter per [`FilterKind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ResultFilter>", into = "Vec<ResultFilter>")]
pub struct FilterSet {
    filters: BTreeMap<FilterKind, ResultFilter>,
}

impl FilterSet {
    /// An empty set; every result passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter, replacing and returning any filter of the same kind.
    pub fn insert(&mut self, filter: ResultFilter) -> Option<ResultFilter> {
        self.filters.insert(filter.kind(), filter)
    }

    /// Remove the filter of `kind`.
    pub fn remove(&mut self, kind: FilterKind) -> Option<ResultFilter> {
        self.filters.remove(&kind)
    }

    /// The active filters in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &ResultFilter> {
        self.filters.values()
    }

    /// Number of active filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether no filter is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl ResultPredicate for FilterSet {
    fn keep(&self, result: &PairwiseResult) -> bool {
        self.filters.values().all(|f| f.keep(result))
    }
}

impl From<Vec<ResultFilter>> for FilterSet {
    fn from(filters: Vec<ResultFilter>) -> Self {
        filters.into_iter().collect()
    }
}

impl From<FilterSet> for Vec<ResultFilter> {
    fn from(set: FilterSet) -> Self {
        set.filters.into_values().collect()
    }
}

impl FromIterator<ResultFilter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = ResultFilter>>(iter: I) -> Self {
        let mut set = Self::new();
        for filter in iter {
            set.insert(filter);
        }
        set
    }
}

/// A filtered view over a shared [`ResultRegistry`].
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    registry: Arc<ResultRegistry>,
    filters: FilterSet,
}

impl FilterPipeline {
    /// A pipeline with no active filters over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ResultRegistry>) -> Self {
        Self {
            registry,
            filters: FilterSet::new(),
        }
    }

    /// A pipeline over `registry` with `filters` already active.
    #[must_use]
    pub const fn with_filters(registry: Arc<ResultRegistry>, filters: FilterSet) -> Self {
        Self { registry, filters }
    }

    /// The underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ResultRegistry> {
        &self.registry
    }

    /// The active filters.
    #[must_use]
    pub const fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// Add a filter. A filter of the same kind is replaced and returned.
    pub fn add_filter(&mut self, filter: ResultFilter) -> Option<ResultFilter> {
        self.filters.insert(filter)
    }

    /// Remove the filter of `kind`, if active.
    pub fn clear_filter(&mut self, kind: FilterKind) -> Option<ResultFilter> {
        self.filters.remove(kind)
    }

    /// Remove every filter.
    pub fn clear_filters(&mut self) {
        self.filters = FilterSet::new();
    }

    /// Whether `result` passes every active filter.
    #[must_use]
    pub fn passes(&self, result: &PairwiseResult) -> bool {
        self.filters.keep(result)
    }

    /// Registry entries passing every active filter.
    #[must_use]
    pub fn filtered_results(&self) -> BTreeMap<PairKey, PairwiseResult> {
        self.registry.with_results(|map| {
            map.iter()
                .filter(|(_, r)| self.filters.keep(r))
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect()
        })
    }

    /// Registry entries failing at least one active filter; these are the
    /// links a commit would remove.
    #[must_use]
    pub fn rejected_results(&self) -> BTreeMap<PairKey, PairwiseResult> {
        self.registry.with_results(|map| {
            map.iter()
                .filter(|(_, r)| !self.filters.keep(r))
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect()
        })
    }

    /// Destructively remove from the registry every pair in `candidates`
    /// that fails the active filters. Pairs outside `candidates` are left
    /// alone. Returns the removed keys.
    pub fn apply_to_subset(&self, candidates: &BTreeSet<PairKey>) -> Vec<PairKey> {
        let removed = self.registry.prune(candidates, |r| self.filters.keep(r));
        tracing::info!(
            candidates = candidates.len(),
            removed = removed.len(),
            filters = self.filters.len(),
            "committed result filters"
        );
        removed
    }

    /// [`apply_to_subset`](Self::apply_to_subset) over every stored pair.
    pub fn apply_to_all(&self) -> Vec<PairKey> {
        self.apply_to_subset(&self.registry.pairs())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use nalgebra::Vector3;

    use super::*;
    use crate::view::{Group, View};

    fn g(setup: u32) -> Group {
        Group::single(View::new(0, setup))
    }

    fn link(a: u32, b: u32, shift: [f64; 3], r: f64) -> PairwiseResult {
        PairwiseResult::translation(g(a), g(b), Vector3::from(shift), r).unwrap()
    }

    fn registry() -> Arc<ResultRegistry> {
        let registry = Arc::new(ResultRegistry::new());
        registry.put(link(0, 1, [10.0, 0.0, 0.0], 0.95));
        registry.put(link(1, 2, [0.0, 10.0, 0.0], 0.6));
        registry.put(link(2, 3, [3.0, 4.0, 0.0], 0.3));
        registry.put(link(3, 4, [-50.0, 0.0, 0.0], 0.8));
        registry.put(link(4, 5, [0.0, 0.0, 1.0], -0.2));
        registry
    }

    #[test]
    fn correlation_bounds_are_inclusive() {
        let f = ResultFilter::correlation(0.3, 0.6).unwrap();
        assert!(f.keep(&link(0, 1, [0.0; 3], 0.3)));
        assert!(f.keep(&link(0, 1, [0.0; 3], 0.6)));
        assert!(!f.keep(&link(0, 1, [0.0; 3], 0.61)));
    }

    #[test]
    fn absolute_shift_checks_every_axis() {
        let f = ResultFilter::absolute_shift([10.0, 5.0, 1.0]).unwrap();
        assert!(f.keep(&link(0, 1, [-10.0, 5.0, 1.0], 1.0)));
        assert!(!f.keep(&link(0, 1, [0.0, -5.5, 0.0], 1.0)));
        assert!(!f.keep(&link(0, 1, [0.0, 0.0, 1.01], 1.0)));
    }

    #[test]
    fn shift_magnitude_uses_euclidean_norm() {
        let f = ResultFilter::shift_magnitude(5.0).unwrap();
        assert!(f.keep(&link(0, 1, [3.0, 4.0, 0.0], 1.0)));
        assert!(!f.keep(&link(0, 1, [3.0, 4.0, 0.1], 1.0)));
    }

    #[test]
    fn invalid_filters_are_rejected() {
        assert!(matches!(
            ResultFilter::correlation(0.9, 0.1),
            Err(FilterError::EmptyCorrelationRange { .. })
        ));
        assert!(matches!(
            ResultFilter::correlation(f64::NAN, 0.1),
            Err(FilterError::NanCorrelationBound)
        ));
        assert!(matches!(
            ResultFilter::absolute_shift([1.0, -1.0, 1.0]),
            Err(FilterError::InvalidShiftBound(_))
        ));
        assert!(ResultFilter::shift_magnitude(f64::NAN).is_err());
    }

    #[test]
    fn same_kind_replaces_different_kinds_compose() {
        let mut pipeline = FilterPipeline::new(registry());
        assert!(
            pipeline
                .add_filter(ResultFilter::correlation(0.5, 1.0).unwrap())
                .is_none()
        );
        let previous = pipeline.add_filter(ResultFilter::correlation(0.0, 1.0).unwrap());
        assert_eq!(previous, Some(ResultFilter::correlation(0.5, 1.0).unwrap()));
        assert_eq!(pipeline.filters().len(), 1);
        assert_eq!(pipeline.filtered_results().len(), 4);

        pipeline.add_filter(ResultFilter::shift_magnitude(20.0).unwrap());
        assert_eq!(pipeline.filters().len(), 2);
        assert_eq!(pipeline.filtered_results().len(), 3);

        pipeline.clear_filter(FilterKind::Correlation);
        assert_eq!(pipeline.filtered_results().len(), 4);
    }

    #[test]
    fn filtering_never_mutates_the_registry() {
        let registry = registry();
        let before = registry.snapshot();
        let mut pipeline = FilterPipeline::new(Arc::clone(&registry));
        pipeline.add_filter(ResultFilter::correlation(0.99, 1.0).unwrap());
        assert!(pipeline.filtered_results().is_empty());
        assert_eq!(pipeline.rejected_results().len(), before.len());
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn stricter_filters_never_grow_the_result() {
        let registry = registry();
        let mut pipeline = FilterPipeline::new(Arc::clone(&registry));
        let all = registry.snapshot();
        let mut previous = all.len();
        for min in [-1.0, -0.1, 0.35, 0.7, 0.9, 0.99] {
            pipeline.add_filter(ResultFilter::correlation(min, 1.0).unwrap());
            let filtered = pipeline.filtered_results();
            assert!(filtered.len() <= previous);
            assert!(filtered.keys().all(|k| all.contains_key(k)));
            previous = filtered.len();
        }
    }

    #[test]
    fn commit_only_touches_candidates() {
        let registry = registry();
        let mut pipeline = FilterPipeline::new(Arc::clone(&registry));
        pipeline.add_filter(ResultFilter::correlation(0.5, 1.0).unwrap());

        let filtered = pipeline.filtered_results();
        let candidates = BTreeSet::from([
            PairKey::new(g(0), g(1)).unwrap(),
            PairKey::new(g(2), g(3)).unwrap(),
        ]);
        let removed = pipeline.apply_to_subset(&candidates);
        assert_eq!(removed, vec![PairKey::new(g(2), g(3)).unwrap()]);

        for key in &candidates {
            assert_eq!(registry.contains(key), filtered.contains_key(key));
        }
        // (4, 5) fails the filter but was not a candidate.
        assert!(registry.get_pair(&g(4), &g(5)).is_some());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn apply_to_all_leaves_exactly_the_filtered_set() {
        let registry = registry();
        let mut pipeline = FilterPipeline::new(Arc::clone(&registry));
        pipeline.add_filter(ResultFilter::correlation(0.5, 1.0).unwrap());
        pipeline.add_filter(ResultFilter::absolute_shift([20.0, 20.0, 20.0]).unwrap());
        let expected = pipeline.filtered_results();

        let removed = pipeline.apply_to_all();
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.snapshot(), expected);
    }

    #[test]
    fn filter_set_serde() {
        let set: FilterSet = [
            ResultFilter::correlation(0.5, 1.0).unwrap(),
            ResultFilter::shift_magnitude(30.0).unwrap(),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&set).unwrap();
        let back: FilterSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
