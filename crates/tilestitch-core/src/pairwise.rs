//! Pairwise measurements between groups of views.
//!
//! A [`PairwiseResult`] is the only thing this crate consumes from the
//! image-correlation layer: a transform placing one group relative to
//! another plus a quality score. [`PairKey`] is the canonical unordered
//! pair used everywhere a pair is looked up, filtered or removed.

use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::transform::AffineTransform;
use crate::types::StitchError;
use crate::view::Group;

/// Canonical unordered pair of distinct groups (`low < high`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    low: Group,
    high: Group,
}

impl PairKey {
    /// Canonicalize `{a, b}`.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::SelfLoop`] if `a == b`.
    pub fn new(a: Group, b: Group) -> Result<Self, StitchError> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Ok(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => Err(StitchError::SelfLoop(a)),
        }
    }

    /// The smaller group.
    #[must_use]
    pub const fn low(&self) -> &Group {
        &self.low
    }

    /// The larger group.
    #[must_use]
    pub const fn high(&self) -> &Group {
        &self.high
    }

    /// Whether `group` is one of the two endpoints.
    #[must_use]
    pub fn contains(&self, group: &Group) -> bool {
        &self.low == group || &self.high == group
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// The producer that measured a pairwise result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MeasurementMethod {
    /// Fourier phase correlation.
    #[default]
    PhaseCorrelation,
    /// Iterative Lucas-Kanade refinement.
    LucasKanade,
    /// Interest-point detection and matching.
    InterestPoints,
    /// Entered or edited by hand.
    Manual,
}

/// Axis-aligned box (global coordinates) of the overlap a measurement
/// was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Minimum corner.
    pub min: [f64; 3],
    /// Maximum corner.
    pub max: [f64; 3],
}

/// One measured spatial relationship between two groups.
///
/// Stored in its measured direction `a -> b`: [`transform`](Self::transform)
/// places `b` relative to `a`. The inverse is derived once at
/// construction, so `inverse(transform) == inverse_transform` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PairwiseRecord", into = "PairwiseRecord")]
pub struct PairwiseResult {
    a: Group,
    b: Group,
    transform: AffineTransform,
    inverse_transform: AffineTransform,
    correlation: f64,
    method: MeasurementMethod,
    bounds: Option<BoundingBox>,
}

impl PairwiseResult {
    /// Validate and build a result placing `b` relative to `a`.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::SelfLoop`] if `a == b`,
    /// [`StitchError::NonInvertibleTransform`] if `transform` is singular
    /// or non-finite, and [`StitchError::NonFiniteCorrelation`] if
    /// `correlation` is NaN or infinite.
    pub fn new(
        a: Group,
        b: Group,
        transform: AffineTransform,
        correlation: f64,
    ) -> Result<Self, StitchError> {
        if a == b {
            return Err(StitchError::SelfLoop(a));
        }
        if !correlation.is_finite() {
            return Err(StitchError::NonFiniteCorrelation(correlation));
        }
        let Some(inverse_transform) = transform.try_inverse() else {
            return Err(StitchError::NonInvertibleTransform { a, b });
        };
        Ok(Self {
            a,
            b,
            transform,
            inverse_transform,
            correlation,
            method: MeasurementMethod::default(),
            bounds: None,
        })
    }

    /// Build a pure-translation result.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn translation(
        a: Group,
        b: Group,
        shift: Vector3<f64>,
        correlation: f64,
    ) -> Result<Self, StitchError> {
        Self::new(a, b, AffineTransform::from_translation(shift), correlation)
    }

    /// Record which producer measured this result.
    #[must_use]
    pub const fn with_method(mut self, method: MeasurementMethod) -> Self {
        self.method = method;
        self
    }

    /// Record the overlap box the measurement was computed on.
    #[must_use]
    pub const fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Canonical key of this pair.
    #[must_use]
    pub fn key(&self) -> PairKey {
        if self.a < self.b {
            PairKey {
                low: self.a.clone(),
                high: self.b.clone(),
            }
        } else {
            PairKey {
                low: self.b.clone(),
                high: self.a.clone(),
            }
        }
    }

    /// The reference group (`a`).
    #[must_use]
    pub const fn a(&self) -> &Group {
        &self.a
    }

    /// The placed group (`b`).
    #[must_use]
    pub const fn b(&self) -> &Group {
        &self.b
    }

    /// Transform placing `b` relative to `a`.
    #[must_use]
    pub const fn transform(&self) -> &AffineTransform {
        &self.transform
    }

    /// Transform placing `a` relative to `b`.
    #[must_use]
    pub const fn inverse_transform(&self) -> &AffineTransform {
        &self.inverse_transform
    }

    /// Translation part of [`transform`](Self::transform).
    #[must_use]
    pub const fn shift(&self) -> &Vector3<f64> {
        &self.transform.translation
    }

    /// Correlation score; higher is better.
    #[must_use]
    pub const fn correlation(&self) -> f64 {
        self.correlation
    }

    /// Producer of this measurement.
    #[must_use]
    pub const fn method(&self) -> MeasurementMethod {
        self.method
    }

    /// Overlap box, if the producer recorded one.
    #[must_use]
    pub const fn bounds(&self) -> Option<&BoundingBox> {
        self.bounds.as_ref()
    }

    /// The transform placing the other endpoint relative to `from`, or
    /// `None` if `from` is not an endpoint.
    #[must_use]
    pub fn transform_from(&self, from: &Group) -> Option<&AffineTransform> {
        if from == &self.a {
            Some(&self.transform)
        } else if from == &self.b {
            Some(&self.inverse_transform)
        } else {
            None
        }
    }

    /// The same measurement expressed in the opposite direction.
    #[must_use]
    pub fn reversed(self) -> Self {
        Self {
            a: self.b,
            b: self.a,
            transform: self.inverse_transform,
            inverse_transform: self.transform,
            correlation: self.correlation,
            method: self.method,
            bounds: self.bounds,
        }
    }
}

/// Serialized form of [`PairwiseResult`]; the inverse is recomputed on load.
#[derive(Serialize, Deserialize)]
struct PairwiseRecord {
    a: Group,
    b: Group,
    transform: AffineTransform,
    correlation: f64,
    #[serde(default)]
    method: MeasurementMethod,
    #[serde(default)]
    bounds: Option<BoundingBox>,
}

impl TryFrom<PairwiseRecord> for PairwiseResult {
    type Error = StitchError;

    fn try_from(record: PairwiseRecord) -> Result<Self, Self::Error> {
        let mut result = Self::new(record.a, record.b, record.transform, record.correlation)?;
        result.method = record.method;
        result.bounds = record.bounds;
        Ok(result)
    }
}

impl From<PairwiseResult> for PairwiseRecord {
    fn from(result: PairwiseResult) -> Self {
        Self {
            a: result.a,
            b: result.b,
            transform: result.transform,
            correlation: result.correlation,
            method: result.method,
            bounds: result.bounds,
        }
    }
}
