//! Views, groups and the classification metadata attached to them.
//!
//! A [`View`] identifies one acquired image. A [`Group`] is the set of
//! views treated as one stitching node (for example all channels of one
//! physical tile). The [`ViewCatalog`] carries the static per-view
//! attributes (channel, illumination, tile, angle) that grouping and
//! aggregation classify views by.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::StitchError;

/// One acquired image, identified by timepoint and view setup.
///
/// Ordered by `(timepoint, setup)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct View {
    /// Timepoint id.
    pub timepoint: u32,
    /// View setup id.
    pub setup: u32,
}

impl View {
    /// Create a new view id.
    #[must_use]
    pub const fn new(timepoint: u32, setup: u32) -> Self {
        Self { timepoint, setup }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp{}/s{}", self.timepoint, self.setup)
    }
}

/// An ordered, deduplicated, non-empty set of views forming one node.
///
/// Equality is set equality. Groups are totally ordered (lexicographic
/// over their sorted members), which is what lets an unordered pair of
/// groups be canonicalized into a [`PairKey`](crate::PairKey).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<View>", into = "Vec<View>")]
pub struct Group(BTreeSet<View>);

impl Group {
    /// Create a group from any collection of views.
    ///
    /// Duplicates are collapsed.
    ///
    /// # Errors
    ///
    /// Returns [`StitchError::EmptyGroup`] if `views` is empty.
    pub fn new(views: impl IntoIterator<Item = View>) -> Result<Self, StitchError> {
        let set: BTreeSet<View> = views.into_iter().collect();
        if set.is_empty() {
            return Err(StitchError::EmptyGroup);
        }
        Ok(Self(set))
    }

    /// A group holding exactly one view.
    #[must_use]
    pub fn single(view: View) -> Self {
        Self(BTreeSet::from([view]))
    }

    /// Member views in ascending order.
    #[must_use]
    pub const fn views(&self) -> &BTreeSet<View> {
        &self.0
    }

    /// Number of member views. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; groups cannot be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `view` is a member.
    #[must_use]
    pub fn contains(&self, view: &View) -> bool {
        self.0.contains(view)
    }

    /// Whether any member of this group is in `views`.
    #[must_use]
    pub fn intersects(&self, views: &BTreeSet<View>) -> bool {
        self.0.iter().any(|v| views.contains(v))
    }

    /// Whether every member of this group is in `views`.
    #[must_use]
    pub fn is_subset(&self, views: &BTreeSet<View>) -> bool {
        self.0.is_subset(views)
    }

    /// Smallest member view.
    #[must_use]
    pub fn first(&self) -> Option<&View> {
        self.0.first()
    }

    /// Iterate over member views in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.0.iter()
    }
}

impl From<View> for Group {
    fn from(view: View) -> Self {
        Self::single(view)
    }
}

impl TryFrom<Vec<View>> for Group {
    type Error = StitchError;

    fn try_from(views: Vec<View>) -> Result<Self, Self::Error> {
        Self::new(views)
    }
}

impl From<Group> for Vec<View> {
    fn from(group: Group) -> Self {
        group.0.into_iter().collect()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, view) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{view}")?;
        }
        f.write_str("]")
    }
}

/// A classification axis views can differ along.
///
/// The declaration order is the order the aggregator resolves axes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Acquisition timepoint.
    Timepoint,
    /// Fluorescence channel.
    Channel,
    /// Illumination direction.
    Illumination,
    /// Physical tile (stage position).
    Tile,
    /// Rotation angle.
    Angle,
}

impl Axis {
    /// Every axis, in resolution order.
    pub const ALL: [Self; 5] = [
        Self::Timepoint,
        Self::Channel,
        Self::Illumination,
        Self::Tile,
        Self::Angle,
    ];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timepoint => "timepoint",
            Self::Channel => "channel",
            Self::Illumination => "illumination",
            Self::Tile => "tile",
            Self::Angle => "angle",
        };
        f.write_str(name)
    }
}

/// Static attributes of a view setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewAttributes {
    /// Channel id.
    pub channel: u32,
    /// Illumination id.
    pub illumination: u32,
    /// Tile id.
    pub tile: u32,
    /// Angle id.
    pub angle: u32,
}

impl ViewAttributes {
    /// Attributes of a single-channel, single-illumination tile.
    #[must_use]
    pub const fn tile(tile: u32) -> Self {
        Self {
            channel: 0,
            illumination: 0,
            tile,
            angle: 0,
        }
    }
}

/// Per-view classification metadata for the whole dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewCatalog {
    views: BTreeMap<View, ViewAttributes>,
}

impl ViewCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the attributes of a view.
    pub fn insert(&mut self, view: View, attributes: ViewAttributes) {
        self.views.insert(view, attributes);
    }

    /// Attributes of `view`, if known.
    #[must_use]
    pub fn attributes(&self, view: &View) -> Option<&ViewAttributes> {
        self.views.get(view)
    }

    /// Whether the catalog knows `view`.
    #[must_use]
    pub fn contains(&self, view: &View) -> bool {
        self.views.contains_key(view)
    }

    /// The value of `view` along `axis`, if the view is known.
    #[must_use]
    pub fn axis_value(&self, view: &View, axis: Axis) -> Option<u32> {
        let attributes = self.views.get(view)?;
        Some(match axis {
            Axis::Timepoint => view.timepoint,
            Axis::Channel => attributes.channel,
            Axis::Illumination => attributes.illumination,
            Axis::Tile => attributes.tile,
            Axis::Angle => attributes.angle,
        })
    }

    /// All known views in ascending order.
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.keys()
    }

    /// Number of known views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

impl FromIterator<(View, ViewAttributes)> for ViewCatalog {
    fn from_iter<I: IntoIterator<Item = (View, ViewAttributes)>>(iter: I) -> Self {
        Self {
            views: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn views_order_by_timepoint_then_setup() {
        let mut views = vec![View::new(1, 0), View::new(0, 5), View::new(0, 2)];
        views.sort();
        assert_eq!(views, vec![View::new(0, 2), View::new(0, 5), View::new(1, 0)]);
    }

    #[test]
    fn group_deduplicates_and_compares_as_set() {
        let a = Group::new([View::new(0, 1), View::new(0, 0), View::new(0, 1)]).unwrap();
        let b = Group::new([View::new(0, 0), View::new(0, 1)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.first(), Some(&View::new(0, 0)));
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(matches!(
            Group::new(Vec::<View>::new()),
            Err(StitchError::EmptyGroup)
        ));
    }

    #[test]
    fn group_intersection_and_subset() {
        let group = Group::new([View::new(0, 0), View::new(0, 1)]).unwrap();
        let some = BTreeSet::from([View::new(0, 1), View::new(0, 7)]);
        let none = BTreeSet::from([View::new(3, 3)]);
        let all = BTreeSet::from([View::new(0, 0), View::new(0, 1), View::new(0, 2)]);
        assert!(group.intersects(&some));
        assert!(!group.intersects(&none));
        assert!(group.is_subset(&all));
        assert!(!group.is_subset(&some));
    }

    #[test]
    fn group_serde_rejects_empty_list() {
        let parsed: Result<Group, _> = serde_json::from_str("[]");
        assert!(parsed.is_err());
        let parsed: Group = serde_json::from_str(r#"[{"timepoint":0,"setup":3}]"#).unwrap();
        assert_eq!(parsed, Group::single(View::new(0, 3)));
    }

    #[test]
    fn catalog_axis_values() {
        let catalog: ViewCatalog = [(
            View::new(4, 2),
            ViewAttributes {
                channel: 1,
                illumination: 2,
                tile: 3,
                angle: 4,
            },
        )]
        .into_iter()
        .collect();
        let view = View::new(4, 2);
        assert_eq!(catalog.axis_value(&view, Axis::Timepoint), Some(4));
        assert_eq!(catalog.axis_value(&view, Axis::Channel), Some(1));
        assert_eq!(catalog.axis_value(&view, Axis::Illumination), Some(2));
        assert_eq!(catalog.axis_value(&view, Axis::Tile), Some(3));
        assert_eq!(catalog.axis_value(&view, Axis::Angle), Some(4));
        assert_eq!(catalog.axis_value(&View::new(0, 0), Axis::Tile), None);
    }
}
