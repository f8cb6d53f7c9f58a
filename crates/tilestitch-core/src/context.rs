//! Shared state of one stitching dataset.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::aggregate::ViewImages;
use crate::filter::{FilterPipeline, FilterSet};
use crate::placement::ViewRegistrations;
use crate::registry::ResultRegistry;
use crate::types::{OptimizeError, SolveError};
use crate::view::ViewCatalog;

/// Everything the stitching core operates on for one dataset.
///
/// Cloning is cheap and every clone shares the same registry and
/// registrations. The run guard lives on the [`ViewRegistrations`], so at
/// most one global optimization runs over a set of chains no matter which
/// context starts it.
#[derive(Debug, Clone)]
pub struct StitchingContext {
    catalog: Arc<ViewCatalog>,
    registry: Arc<ResultRegistry>,
    registrations: Arc<ViewRegistrations>,
    images: Arc<ViewImages>,
}

impl StitchingContext {
    /// Bundle a dataset with an empty image set.
    #[must_use]
    pub fn new(
        catalog: Arc<ViewCatalog>,
        registry: Arc<ResultRegistry>,
        registrations: Arc<ViewRegistrations>,
    ) -> Self {
        Self {
            catalog,
            registry,
            registrations,
            images: Arc::new(ViewImages::new()),
        }
    }

    /// Attach the images used to score `PickBest` aggregation policies.
    #[must_use]
    pub fn with_images(mut self, images: Arc<ViewImages>) -> Self {
        self.images = images;
        self
    }

    /// Per-view classification metadata.
    #[must_use]
    pub fn catalog(&self) -> &ViewCatalog {
        &self.catalog
    }

    /// The pairwise result registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ResultRegistry> {
        &self.registry
    }

    /// The per-view transform chains.
    #[must_use]
    pub fn registrations(&self) -> &ViewRegistrations {
        &self.registrations
    }

    /// Images available for aggregation.
    #[must_use]
    pub fn images(&self) -> &ViewImages {
        &self.images
    }

    /// A filter pipeline over this dataset's registry.
    #[must_use]
    pub fn pipeline(&self, filters: FilterSet) -> FilterPipeline {
        FilterPipeline::with_filters(Arc::clone(&self.registry), filters)
    }

    /// Whether a global optimization currently holds the run guard.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.registrations.is_optimizing()
    }

    /// Take the single-run guard.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizeError::AlreadyRunning`] if another run holds it.
    pub(crate) fn begin_run(&self) -> Result<RunGuard, OptimizeError> {
        if !self.registrations.try_claim() {
            return Err(OptimizeError::AlreadyRunning);
        }
        Ok(RunGuard {
            registrations: Arc::clone(&self.registrations),
        })
    }
}

/// Releases the run guard when dropped.
#[derive(Debug)]
pub(crate) struct RunGuard {
    registrations: Arc<ViewRegistrations>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registrations.release();
    }
}

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`SolveError::Cancelled`] if the token was cancelled.
    pub fn check(&self) -> Result<(), SolveError> {
        if self.is_cancelled() {
            Err(SolveError::Cancelled)
        } else {
            Ok(())
        }
    }
}
