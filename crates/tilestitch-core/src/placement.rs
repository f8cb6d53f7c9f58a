//! Per-view transform chains.
//!
//! Each view carries an ordered chain of named transforms (calibration,
//! nominal stage translation, manual corrections, ...). Entries are
//! applied in order, first to last, so the global transform is
//! `last ∘ ... ∘ first`. The optimizer only ever appends or replaces the
//! trailing [`STITCHING`] entry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::pairwise::PairwiseResult;
use crate::transform::AffineTransform;
use crate::types::AggregateError;
use crate::view::{Group, View};

/// Name of the entry written by the global optimizer.
pub const STITCHING: &str = "stitching";

/// One named entry of a transform chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTransform {
    /// Human-readable name ("calibration", "translation", ...).
    pub name: String,
    /// The transform.
    pub transform: AffineTransform,
}

impl NamedTransform {
    /// Create a named entry.
    #[must_use]
    pub fn new(name: impl Into<String>, transform: AffineTransform) -> Self {
        Self {
            name: name.into(),
            transform,
        }
    }
}

/// Ordered chain of transforms placing one view in the global frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformChain {
    entries: Vec<NamedTransform>,
}

impl TransformChain {
    /// An empty chain (identity placement).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, applied after every existing entry.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, transform: AffineTransform) -> Self {
        self.push(name, transform);
        self
    }

    /// Append an entry, applied after every existing entry.
    pub fn push(&mut self, name: impl Into<String>, transform: AffineTransform) {
        self.entries.push(NamedTransform::new(name, transform));
    }

    /// Entries in application order.
    #[must_use]
    pub fn entries(&self) -> &[NamedTransform] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The composition of every entry.
    #[must_use]
    pub fn global(&self) -> AffineTransform {
        self.entries
            .iter()
            .fold(AffineTransform::identity(), |acc, entry| {
                entry.transform.compose(&acc)
            })
    }

    /// The trailing stitching correction, if one has been written.
    #[must_use]
    pub fn stitching(&self) -> Option<&AffineTransform> {
        self.entries
            .last()
            .filter(|e| e.name == STITCHING)
            .map(|e| &e.transform)
    }

    /// Replace the trailing stitching entry, or append one if the chain
    /// does not end with one.
    pub fn set_stitching(&mut self, stitching: AffineTransform) {
        if self.stitching().is_some() {
            self.entries.pop();
        }
        self.entries.push(NamedTransform::new(STITCHING, stitching));
    }

    /// Move the view by `correction` in the global frame.
    ///
    /// The correction is folded into the trailing stitching entry, so the
    /// chain never grows more than one stitching entry and the new global
    /// transform is `correction ∘ global`.
    pub fn correct(&mut self, correction: &AffineTransform) {
        let stitching = self
            .stitching()
            .map_or(*correction, |current| correction.compose(current));
        self.set_stitching(stitching);
    }

    /// The global transform without the trailing stitching entry.
    #[must_use]
    pub fn pre_stitching(&self) -> AffineTransform {
        let end = self.entries.len() - usize::from(self.stitching().is_some());
        self.entries[..end]
            .iter()
            .fold(AffineTransform::identity(), |acc, entry| {
                entry.transform.compose(&acc)
            })
    }
}

/// The transform chains of every view in the dataset.
///
/// Also carries the single-run flag of global optimization, so every
/// context sharing these chains shares one run guard.
#[derive(Debug, Default)]
pub struct ViewRegistrations {
    chains: RwLock<BTreeMap<View, TransformChain>>,
    optimizing: AtomicBool,
}

impl ViewRegistrations {
    /// Create an empty registration table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) the chain of `view`.
    pub fn insert(&self, view: View, chain: TransformChain) {
        self.chains.write().insert(view, chain);
    }

    /// A copy of the chain of `view`.
    #[must_use]
    pub fn chain(&self, view: &View) -> Option<TransformChain> {
        self.chains.read().get(view).cloned()
    }

    /// Whether `view` has a chain.
    #[must_use]
    pub fn contains(&self, view: &View) -> bool {
        self.chains.read().contains_key(view)
    }

    /// Current global transform of `view`.
    #[must_use]
    pub fn global(&self, view: &View) -> Option<AffineTransform> {
        self.chains.read().get(view).map(TransformChain::global)
    }

    /// Current global transforms of several views, read under one lock.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::MissingRegistration`] for the first view
    /// without a chain.
    pub fn globals<'a>(
        &self,
        views: impl IntoIterator<Item = &'a View>,
    ) -> Result<Vec<AffineTransform>, AggregateError> {
        let chains = self.chains.read();
        views
            .into_iter()
            .map(|v| {
                chains
                    .get(v)
                    .map(TransformChain::global)
                    .ok_or(AggregateError::MissingRegistration(*v))
            })
            .collect()
    }

    /// A consistent copy of every chain.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<View, TransformChain> {
        self.chains.read().clone()
    }

    /// All views with a chain.
    #[must_use]
    pub fn views(&self) -> BTreeSet<View> {
        self.chains.read().keys().copied().collect()
    }

    /// Whether a global optimization currently owns these chains.
    #[must_use]
    pub fn is_optimizing(&self) -> bool {
        self.optimizing.load(Ordering::Acquire)
    }

    /// Claim the chains for one optimization run. `false` if already
    /// claimed.
    pub(crate) fn try_claim(&self) -> bool {
        self.optimizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.optimizing.store(false, Ordering::Release);
    }

    /// Apply a global-frame correction to every view in `corrections`
    /// (see [`TransformChain::correct`]).
    ///
    /// All-or-nothing: if any view has no chain, nothing is written and
    /// the first missing view is returned. The whole batch is applied under
    /// one write lock, so readers see either none or all of it.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::MissingRegistration`] if any view in
    /// `corrections` has no chain.
    pub fn commit(
        &self,
        corrections: &BTreeMap<View, AffineTransform>,
    ) -> Result<(), AggregateError> {
        let mut chains = self.chains.write();
        if let Some(missing) = corrections.keys().find(|v| !chains.contains_key(*v)) {
            return Err(AggregateError::MissingRegistration(*missing));
        }
        for (view, correction) in corrections {
            if let Some(chain) = chains.get_mut(view) {
                chain.correct(correction);
            }
        }
        Ok(())
    }
}

/// Mean translation of the current global transforms of a group.
fn group_position(registrations: &ViewRegistrations, group: &Group) -> Option<Vector3<f64>> {
    let globals = registrations.globals(group.iter()).ok()?;
    AffineTransform::mean(&globals).map(|t| t.translation)
}

/// Distance between a link's measured translation and the translation
/// implied by the current placements of its two groups.
///
/// This is the standard metric for
/// [`ResultRegistry::error_statistics`](crate::ResultRegistry::error_statistics).
/// Returns `None` if either group has a view without a chain.
#[must_use]
pub fn link_residual(registrations: &ViewRegistrations, result: &PairwiseResult) -> Option<f64> {
    let a = group_position(registrations, result.a())?;
    let b = group_position(registrations, result.b())?;
    Some(((b - a) - result.shift()).norm())
}
