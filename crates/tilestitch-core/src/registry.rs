//! The shared registry of pairwise results.
//!
//! [`ResultRegistry`] owns the full measurement graph: at most one
//! [`PairwiseResult`] per unordered pair of groups. It is long-lived and
//! shared between measurement producers, the optimizer and any display
//! layer, so every method takes `&self` and each mutation is a single
//! write-lock acquisition. Readers never observe a half-applied change.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::pairwise::{PairKey, PairwiseResult};
use crate::view::{Group, View};

/// Summary of a per-link error metric over the links of one view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Mean error.
    pub mean: f64,
    /// Smallest error.
    pub min: f64,
    /// Largest error.
    pub max: f64,
    /// Number of links the statistics cover.
    pub count: usize,
}

impl ErrorStatistics {
    /// Statistics over a sequence of values, or `None` when it is empty.
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut count = 0_usize;
        for v in values {
            sum += v;
            min = min.min(v);
            max = max.max(v);
            count += 1;
        }
        if count == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = sum / count as f64;
        Some(Self {
            mean,
            min,
            max,
            count,
        })
    }
}

/// Keyed store of pairwise results.
#[derive(Debug, Default)]
pub struct ResultRegistry {
    results: RwLock<BTreeMap<PairKey, PairwiseResult>>,
}

impl ResultRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a result, replacing any earlier result for the same pair.
    ///
    /// Returns the replaced result.
    pub fn put(&self, result: PairwiseResult) -> Option<PairwiseResult> {
        let key = result.key();
        self.results.write().insert(key, result)
    }

    /// Insert many results under one lock acquisition.
    pub fn extend(&self, results: impl IntoIterator<Item = PairwiseResult>) {
        let mut map = self.results.write();
        for result in results {
            map.insert(result.key(), result);
        }
    }

    /// The result stored for `key`.
    #[must_use]
    pub fn get(&self, key: &PairKey) -> Option<PairwiseResult> {
        self.results.read().get(key).cloned()
    }

    /// The result stored for `{a, b}` in either direction.
    #[must_use]
    pub fn get_pair(&self, a: &Group, b: &Group) -> Option<PairwiseResult> {
        let key = PairKey::new(a.clone(), b.clone()).ok()?;
        self.get(&key)
    }

    /// Whether a result is stored for `key`.
    #[must_use]
    pub fn contains(&self, key: &PairKey) -> bool {
        self.results.read().contains_key(key)
    }

    /// Remove the result for `key`. Removing an absent pair is a no-op.
    pub fn remove(&self, key: &PairKey) -> Option<PairwiseResult> {
        self.results.write().remove(key)
    }

    /// Remove every result in `keys`; returns the keys actually removed.
    pub fn remove_all<'a>(&self, keys: impl IntoIterator<Item = &'a PairKey>) -> Vec<PairKey> {
        let mut map = self.results.write();
        keys.into_iter()
            .filter(|key| map.remove(*key).is_some())
            .cloned()
            .collect()
    }

    /// Drop every result.
    pub fn clear(&self) {
        self.results.write().clear();
    }

    /// Number of stored results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.read().is_empty()
    }

    /// All stored pair keys, in canonical order.
    #[must_use]
    pub fn pairs(&self) -> BTreeSet<PairKey> {
        self.results.read().keys().cloned().collect()
    }

    /// A consistent copy of every stored result.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<PairKey, PairwiseResult> {
        self.results.read().clone()
    }

    /// Run `f` against the stored results under the read lock.
    pub fn with_results<R>(&self, f: impl FnOnce(&BTreeMap<PairKey, PairwiseResult>) -> R) -> R {
        f(&self.results.read())
    }

    /// Every result whose `a` or `b` group contains a view from `views`.
    #[must_use]
    pub fn results_touching(&self, views: &BTreeSet<View>) -> Vec<PairwiseResult> {
        self.results
            .read()
            .values()
            .filter(|r| touches(r, views))
            .cloned()
            .collect()
    }

    /// Remove every result touching `views` (cascade when views are
    /// dropped from the dataset). Returns the removed keys.
    pub fn remove_touching(&self, views: &BTreeSet<View>) -> Vec<PairKey> {
        let mut map = self.results.write();
        let doomed: Vec<PairKey> = map
            .iter()
            .filter(|(_, r)| touches(r, views))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            map.remove(key);
        }
        doomed
    }

    /// Mean correlation over every result touching `view`.
    ///
    /// `None` means the view has no links, which is distinct from a mean
    /// correlation of zero.
    #[must_use]
    pub fn average_correlation(&self, view: &View) -> Option<f64> {
        let map = self.results.read();
        let (sum, count) = map
            .values()
            .filter(|r| r.a().contains(view) || r.b().contains(view))
            .fold((0.0, 0_u32), |(sum, count), r| {
                (sum + r.correlation(), count + 1)
            });
        (count > 0).then(|| sum / f64::from(count))
    }

    /// Statistics of `metric` over every result touching `view`.
    ///
    /// Results for which `metric` returns `None` are skipped. `None` means
    /// there was no data to summarize.
    pub fn error_statistics(
        &self,
        view: &View,
        metric: impl Fn(&PairwiseResult) -> Option<f64>,
    ) -> Option<ErrorStatistics> {
        let map = self.results.read();
        ErrorStatistics::from_values(
            map.values()
                .filter(|r| r.a().contains(view) || r.b().contains(view))
                .filter_map(metric),
        )
    }

    /// Remove, under one write lock, every pair in `candidates` whose
    /// stored result fails `keep`. Pairs outside `candidates` are never
    /// touched. Returns the removed keys.
    pub fn prune(
        &self,
        candidates: &BTreeSet<PairKey>,
        keep: impl Fn(&PairwiseResult) -> bool,
    ) -> Vec<PairKey> {
        let mut map = self.results.write();
        let doomed: Vec<PairKey> = candidates
            .iter()
            .filter(|key| map.get(*key).is_some_and(|r| !keep(r)))
            .cloned()
            .collect();
        for key in &doomed {
            map.remove(key);
        }
        doomed
    }
}

fn touches(result: &PairwiseResult, views: &BTreeSet<View>) -> bool {
    result.a().intersects(views) || result.b().intersects(views)
}
