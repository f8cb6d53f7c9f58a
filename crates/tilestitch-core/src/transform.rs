//! 3-D affine transforms.
//!
//! Pairwise measurements and view placements are affine maps. In
//! practice nearly all of them are pure translations, but calibration
//! entries in a view's transform chain routinely carry anisotropic
//! scaling, so the linear part is kept general.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Tolerance used when deciding whether a linear part is the identity.
pub const IDENTITY_TOLERANCE: f64 = 1e-12;

/// An affine map `x -> linear * x + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    /// The 3x3 linear part.
    pub linear: Matrix3<f64>,
    /// The translation part.
    pub translation: Vector3<f64>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    /// The identity transform.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            linear: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// A pure translation.
    #[must_use]
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            linear: Matrix3::identity(),
            translation,
        }
    }

    /// A pure translation from its three components.
    #[must_use]
    pub fn translation_xyz(x: f64, y: f64, z: f64) -> Self {
        Self::from_translation(Vector3::new(x, y, z))
    }

    /// Anisotropic scaling about the origin.
    #[must_use]
    pub fn scaling(x: f64, y: f64, z: f64) -> Self {
        Self {
            linear: Matrix3::from_diagonal(&Vector3::new(x, y, z)),
            translation: Vector3::zeros(),
        }
    }

    /// Apply the transform to a point.
    #[must_use]
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.linear * point + self.translation
    }

    /// Composition `self ∘ inner`: apply `inner` first, then `self`.
    #[must_use]
    pub fn compose(&self, inner: &Self) -> Self {
        Self {
            linear: self.linear * inner.linear,
            translation: self.linear * inner.translation + self.translation,
        }
    }

    /// The inverse map, or `None` if the linear part is singular or any
    /// component is non-finite.
    #[must_use]
    pub fn try_inverse(&self) -> Option<Self> {
        if !self.is_finite() {
            return None;
        }
        let inverse_linear = self.linear.try_inverse()?;
        let inverse = Self {
            linear: inverse_linear,
            translation: -(inverse_linear * self.translation),
        };
        inverse.is_finite().then_some(inverse)
    }

    /// Whether every component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.linear.iter().all(|v| v.is_finite()) && self.translation.iter().all(|v| v.is_finite())
    }

    /// Whether the linear part is the identity (within [`IDENTITY_TOLERANCE`]).
    #[must_use]
    pub fn is_translation(&self) -> bool {
        (self.linear - Matrix3::identity()).amax() <= IDENTITY_TOLERANCE
    }

    /// Component-wise comparison within `tolerance`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        (self.linear - other.linear).amax() <= tolerance
            && (self.translation - other.translation).amax() <= tolerance
    }

    /// Element-wise mean of several transforms, or `None` when empty.
    ///
    /// For pure translations this is the mean translation.
    #[must_use]
    pub fn mean<'a>(transforms: impl IntoIterator<Item = &'a Self>) -> Option<Self> {
        let mut linear = Matrix3::zeros();
        let mut translation = Vector3::zeros();
        let mut count = 0_u32;
        for t in transforms {
            linear += t.linear;
            translation += t.translation;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let n = f64::from(count);
        Some(Self {
            linear: linear / n,
            translation: translation / n,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn compose_applies_inner_first() {
        let scale = AffineTransform::scaling(2.0, 2.0, 1.0);
        let shift = AffineTransform::translation_xyz(1.0, 0.0, 0.0);
        let p = Vector3::new(1.0, 1.0, 1.0);

        // shift then scale
        let t = scale.compose(&shift);
        assert_eq!(t.apply(&p), Vector3::new(4.0, 2.0, 1.0));

        // scale then shift
        let t = shift.compose(&scale);
        assert_eq!(t.apply(&p), Vector3::new(3.0, 2.0, 1.0));
    }

    #[test]
    fn inverse_round_trips() {
        let t = AffineTransform::scaling(2.0, 0.5, 4.0)
            .compose(&AffineTransform::translation_xyz(3.0, -1.0, 7.5));
        let inv = t.try_inverse().unwrap();
        assert!(t.compose(&inv).approx_eq(&AffineTransform::identity(), 1e-12));
        assert!(inv.compose(&t).approx_eq(&AffineTransform::identity(), 1e-12));
    }

    #[test]
    fn singular_transform_has_no_inverse() {
        let t = AffineTransform::scaling(1.0, 0.0, 1.0);
        assert!(t.try_inverse().is_none());
    }

    #[test]
    fn non_finite_transform_has_no_inverse() {
        let t = AffineTransform::translation_xyz(f64::NAN, 0.0, 0.0);
        assert!(!t.is_finite());
        assert!(t.try_inverse().is_none());
    }

    #[test]
    fn translation_detection() {
        assert!(AffineTransform::translation_xyz(5.0, 6.0, 7.0).is_translation());
        assert!(!AffineTransform::scaling(1.0, 1.0, 1.001).is_translation());
    }

    #[test]
    fn mean_of_translations() {
        let a = AffineTransform::translation_xyz(0.0, 0.0, 0.0);
        let b = AffineTransform::translation_xyz(2.0, 4.0, -6.0);
        let m = AffineTransform::mean([&a, &b]).unwrap();
        assert!(m.approx_eq(&AffineTransform::translation_xyz(1.0, 2.0, -3.0), 1e-12));
        assert!(AffineTransform::mean([]).is_none());
    }
}
