//! Resolution of a group to its representative views.
//!
//! A group may span several channels, illuminations or angles of one
//! physical tile. Before a group can be correlated or placed, each such
//! axis is collapsed according to a per-axis [`AggregationPolicy`]:
//! either every value is kept (and later averaged) or only the best-scoring
//! value survives.
//!
//! Resolution walks the axes in [`Axis`] order and only ever uses ordered
//! containers, so the result never depends on how the inputs were built.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::placement::ViewRegistrations;
use crate::transform::AffineTransform;
use crate::types::AggregateError;
use crate::view::{Axis, Group, View, ViewCatalog};

/// Images available for scoring and averaging, keyed by view.
pub type ViewImages = BTreeMap<View, GrayImage>;

/// How a single image is scored by [`AggregationPolicy::PickBest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Score {
    /// Mean pixel intensity ("pick brightest").
    #[default]
    MeanIntensity,
    /// Maximum pixel intensity.
    MaxIntensity,
}

impl Score {
    /// Score one image. Higher is better; an empty image scores `0.0`.
    #[must_use]
    pub fn evaluate(self, image: &GrayImage) -> f64 {
        match self {
            Self::MeanIntensity => {
                let count = u64::from(image.width()) * u64::from(image.height());
                if count == 0 {
                    return 0.0;
                }
                let sum: u64 = image.pixels().map(|p| u64::from(p.0[0])).sum();
                #[allow(clippy::cast_precision_loss)]
                let mean = sum as f64 / count as f64;
                mean
            }
            Self::MaxIntensity => image
                .pixels()
                .map(|p| p.0[0])
                .max()
                .map_or(0.0, f64::from),
        }
    }
}

/// What to do with an axis a group has more than one value along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationPolicy {
    /// Keep every value; the images are averaged.
    Average,
    /// Keep only the value whose views score highest on average.
    /// Ties go to the smallest axis value.
    PickBest(Score),
}

/// Per-axis aggregation policies.
///
/// Axes without a policy keep only their smallest value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAggregator {
    policies: BTreeMap<Axis, AggregationPolicy>,
}

impl GroupAggregator {
    /// An aggregator with no policies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the policy of `axis`, replacing any previous one.
    #[must_use]
    pub fn with_policy(mut self, axis: Axis, policy: AggregationPolicy) -> Self {
        self.policies.insert(axis, policy);
        self
    }

    /// Set the policy of `axis`, returning the replaced policy.
    pub fn set_policy(&mut self, axis: Axis, policy: AggregationPolicy) -> Option<AggregationPolicy> {
        self.policies.insert(axis, policy)
    }

    /// The policy of `axis`, if one is configured.
    #[must_use]
    pub fn policy(&self, axis: Axis) -> Option<AggregationPolicy> {
        self.policies.get(&axis).copied()
    }

    /// Whether any configured policy needs images to score.
    #[must_use]
    pub fn needs_images(&self) -> bool {
        self.policies
            .values()
            .any(|p| matches!(p, AggregationPolicy::PickBest(_)))
    }

    /// The representative views of `group`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::MissingMetadata`] if a member view is not
    /// in `catalog`, and [`AggregateError::MissingImage`] if a
    /// [`PickBest`](AggregationPolicy::PickBest) axis must score a view that
    /// has no entry in `images`.
    pub fn resolve(
        &self,
        group: &Group,
        images: &ViewImages,
        catalog: &ViewCatalog,
    ) -> Result<Vec<View>, AggregateError> {
        let mut remaining: Vec<View> = group.iter().copied().collect();

        for axis in Axis::ALL {
            let mut by_value: BTreeMap<u32, Vec<View>> = BTreeMap::new();
            for view in &remaining {
                let value = catalog
                    .axis_value(view, axis)
                    .ok_or(AggregateError::MissingMetadata(*view))?;
                by_value.entry(value).or_default().push(*view);
            }
            if by_value.len() <= 1 {
                continue;
            }

            remaining = match self.policies.get(&axis) {
                Some(AggregationPolicy::Average) => continue,
                Some(AggregationPolicy::PickBest(score)) => {
                    pick_best(axis, *score, by_value, images)?
                }
                None => by_value.into_values().next().unwrap_or_default(),
            };
        }

        Ok(remaining)
    }

    /// Resolve `group` and average the representative images pixelwise.
    ///
    /// # Errors
    ///
    /// Everything [`resolve`](Self::resolve) returns, plus
    /// [`AggregateError::ImageUnavailable`] for a representative view without
    /// an image and [`AggregateError::DimensionMismatch`] if the representative
    /// images differ in size.
    pub fn aggregate_images(
        &self,
        group: &Group,
        images: &ViewImages,
        catalog: &ViewCatalog,
    ) -> Result<GrayImage, AggregateError> {
        let views = self.resolve(group, images, catalog)?;
        let mut selected = Vec::with_capacity(views.len());
        for view in &views {
            let image = images
                .get(view)
                .ok_or(AggregateError::ImageUnavailable(*view))?;
            selected.push((*view, image));
        }

        let Some((_, first)) = selected.first() else {
            return Ok(GrayImage::new(0, 0));
        };
        let expected = first.dimensions();
        if let Some((view, image)) = selected.iter().find(|(_, i)| i.dimensions() != expected) {
            return Err(AggregateError::DimensionMismatch {
                view: *view,
                expected,
                actual: image.dimensions(),
            });
        }

        let count = u32::try_from(selected.len()).unwrap_or(u32::MAX);
        Ok(GrayImage::from_fn(expected.0, expected.1, |x, y| {
            let sum: u32 = selected
                .iter()
                .map(|(_, image)| u32::from(image.get_pixel(x, y).0[0]))
                .sum();
            let mean = (sum + count / 2) / count;
            Luma([u8::try_from(mean).unwrap_or(u8::MAX)])
        }))
    }

    /// Resolve `group` and average the current global transforms of its
    /// representative views.
    ///
    /// This is the group's current placement as seen by the optimizer.
    ///
    /// # Errors
    ///
    /// Everything [`resolve`](Self::resolve) returns, plus
    /// [`AggregateError::MissingRegistration`] for a representative view
    /// without a transform chain.
    pub fn aggregate_transform(
        &self,
        group: &Group,
        registrations: &ViewRegistrations,
        images: &ViewImages,
        catalog: &ViewCatalog,
    ) -> Result<AffineTransform, AggregateError> {
        let views = self.resolve(group, images, catalog)?;
        let globals = registrations.globals(&views)?;
        Ok(AffineTransform::mean(&globals).unwrap_or_default())
    }
}

fn pick_best(
    axis: Axis,
    score: Score,
    by_value: BTreeMap<u32, Vec<View>>,
    images: &ViewImages,
) -> Result<Vec<View>, AggregateError> {
    let mut best: Option<(f64, Vec<View>)> = None;
    for views in by_value.into_values() {
        let mut total = 0.0;
        for view in &views {
            let image = images
                .get(view)
                .ok_or(AggregateError::MissingImage { view: *view, axis })?;
            total += score.evaluate(image);
        }
        #[allow(clippy::cast_precision_loss)]
        let average = total / views.len() as f64;
        // strictly greater: ties keep the earlier (smaller) value
        if best.as_ref().is_none_or(|(b, _)| average > *b) {
            best = Some((average, views));
        }
    }
    Ok(best.map(|(_, views)| views).unwrap_or_default())
}
