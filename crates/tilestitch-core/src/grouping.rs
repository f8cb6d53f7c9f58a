//! Node and edge construction for the global optimizer.
//!
//! Selected views are partitioned into nodes by their values along the
//! node axes (every axis that is neither grouping nor application). Within
//! a node, the views sharing the smallest application-axis values form the
//! reference group whose placement stands for the whole node; the computed
//! correction is later replicated to every other application instance.
//!
//! Registry entries become edges between nodes. Entries that do not map
//! cleanly onto two distinct, comparable nodes are skipped and reported.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::SelectionConfig;
use crate::context::StitchingContext;
use crate::pairwise::{PairKey, PairwiseResult};
use crate::types::ConfigError;
use crate::view::{Axis, Group, View, ViewCatalog};

/// Index of a node in a [`NodeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One unknown of the optimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    key: Vec<(Axis, u32)>,
    views: BTreeSet<View>,
    reference: Group,
}

impl Node {
    /// Values along the node axes shared by every view of this node.
    #[must_use]
    pub fn key(&self) -> &[(Axis, u32)] {
        &self.key
    }

    /// Every view of the node, across all application instances.
    #[must_use]
    pub const fn views(&self) -> &BTreeSet<View> {
        &self.views
    }

    /// The views of the first application instance.
    #[must_use]
    pub const fn reference(&self) -> &Group {
        &self.reference
    }
}

/// Why a registry entry did not become an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// One group has no selected view; the link leads out of scope.
    OutsideSelection,
    /// One group mixes selected and unselected views.
    LeavesSelection,
    /// One group has views in more than one node.
    StraddlesNodes,
    /// Both groups fall into the same node.
    SameNode,
    /// The two nodes differ along an axis that is not a comparison axis.
    NotComparable {
        /// First differing axis.
        axis: Axis,
    },
}

impl SkipReason {
    /// Whether the entry is inconsistent with the selection (as opposed to
    /// merely irrelevant to it).
    #[must_use]
    pub const fn is_data_error(self) -> bool {
        matches!(
            self,
            Self::LeavesSelection | Self::StraddlesNodes | Self::SameNode
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideSelection => f.write_str("group lies outside the selection"),
            Self::LeavesSelection => f.write_str("group is only partly selected"),
            Self::StraddlesNodes => f.write_str("group spans more than one node"),
            Self::SameNode => f.write_str("both groups belong to the same node"),
            Self::NotComparable { axis } => {
                write!(f, "nodes differ along non-comparison axis {axis}")
            }
        }
    }
}

/// A registry entry that was not used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLink {
    /// The entry.
    pub key: PairKey,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// A measured relation between two nodes, oriented `from < to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Lower node.
    pub from: NodeId,
    /// Higher node.
    pub to: NodeId,
    /// Measured `x_to - x_from`.
    pub shift: Vector3<f64>,
    /// Correlation of the underlying result.
    pub correlation: f64,
    /// The underlying registry entry.
    pub key: PairKey,
}

/// Edges built from a set of results, plus the entries that were skipped.
#[derive(Debug, Clone, Default)]
pub struct EdgeSet {
    /// Usable edges, in registry key order.
    pub edges: Vec<Edge>,
    /// Entries touching the selection that could not be used.
    pub skipped: Vec<SkippedLink>,
}

/// The nodes of a selection and the view-to-node mapping.
#[derive(Debug, Clone)]
pub struct NodeGraph {
    nodes: Vec<Node>,
    index: BTreeMap<View, NodeId>,
    comparison: BTreeSet<Axis>,
}

impl NodeGraph {
    /// Partition the selected views into nodes.
    ///
    /// Nodes are numbered in ascending order of their node-axis values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownView`] if a selected view is not in
    /// `catalog`.
    pub fn build(selection: &SelectionConfig, catalog: &ViewCatalog) -> Result<Self, ConfigError> {
        let node_axes: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|a| selection.is_node_axis(*a))
            .collect();
        let application_axes: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|a| selection.application.contains(a))
            .collect();

        let values = |view: &View, axes: &[Axis]| -> Result<Vec<(Axis, u32)>, ConfigError> {
            axes.iter()
                .map(|axis| {
                    catalog
                        .axis_value(view, *axis)
                        .map(|v| (*axis, v))
                        .ok_or(ConfigError::UnknownView(*view))
                })
                .collect()
        };

        // node key -> application key -> views
        let mut partition: BTreeMap<Vec<(Axis, u32)>, BTreeMap<Vec<(Axis, u32)>, Vec<View>>> =
            BTreeMap::new();
        for view in &selection.views {
            let key = values(view, &node_axes)?;
            let instance = values(view, &application_axes)?;
            partition
                .entry(key)
                .or_default()
                .entry(instance)
                .or_default()
                .push(*view);
        }

        let mut nodes = Vec::with_capacity(partition.len());
        let mut index = BTreeMap::new();
        for (key, instances) in partition {
            let views: BTreeSet<View> = instances.values().flatten().copied().collect();
            let Some(Ok(reference)) = instances.into_values().next().map(Group::new) else {
                continue;
            };
            let id = NodeId(nodes.len());
            for view in &views {
                index.insert(*view, id);
            }
            nodes.push(Node {
                key,
                views,
                reference,
            });
        }

        Ok(Self {
            nodes,
            index,
            comparison: selection.comparison.clone(),
        })
    }

    /// All nodes, indexed by [`NodeId`].
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the selection produced no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node with index `id`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// The node containing `view`, if it is selected.
    #[must_use]
    pub fn node_of_view(&self, view: &View) -> Option<NodeId> {
        self.index.get(view).copied()
    }

    /// Whether any view of `group` is selected.
    #[must_use]
    pub fn touches(&self, group: &Group) -> bool {
        group.iter().any(|v| self.index.contains_key(v))
    }

    /// The single node every view of `group` belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`SkipReason::OutsideSelection`],
    /// [`SkipReason::LeavesSelection`] or [`SkipReason::StraddlesNodes`].
    pub fn node_of(&self, group: &Group) -> Result<NodeId, SkipReason> {
        let ids: Vec<Option<NodeId>> = group.iter().map(|v| self.node_of_view(v)).collect();
        if ids.iter().all(Option::is_none) {
            return Err(SkipReason::OutsideSelection);
        }
        if ids.iter().any(Option::is_none) {
            return Err(SkipReason::LeavesSelection);
        }
        let mut ids = ids.into_iter().flatten();
        let first = ids.next().ok_or(SkipReason::OutsideSelection)?;
        if ids.any(|id| id != first) {
            Err(SkipReason::StraddlesNodes)
        } else {
            Ok(first)
        }
    }

    /// The first non-comparison axis two nodes differ along.
    fn incomparable_axis(&self, a: NodeId, b: NodeId) -> Option<Axis> {
        let (Some(a), Some(b)) = (self.node(a), self.node(b)) else {
            return None;
        };
        a.key
            .iter()
            .zip(&b.key)
            .find(|((axis, va), (_, vb))| va != vb && !self.comparison.contains(axis))
            .map(|((axis, _), _)| *axis)
    }

    /// Turn one result into an edge.
    ///
    /// Returns `Ok(None)` if neither group touches the selection.
    ///
    /// # Errors
    ///
    /// Returns the [`SkipReason`] if the result touches the selection but
    /// cannot be used.
    pub fn edge(&self, result: &PairwiseResult) -> Result<Option<Edge>, SkipReason> {
        if !self.touches(result.a()) && !self.touches(result.b()) {
            return Ok(None);
        }
        let node_a = self.node_of(result.a())?;
        let node_b = self.node_of(result.b())?;
        if node_a == node_b {
            return Err(SkipReason::SameNode);
        }
        if let Some(axis) = self.incomparable_axis(node_a, node_b) {
            return Err(SkipReason::NotComparable { axis });
        }
        let (from, to, shift) = if node_a < node_b {
            (node_a, node_b, result.transform().translation)
        } else {
            (node_b, node_a, result.inverse_transform().translation)
        };
        Ok(Some(Edge {
            from,
            to,
            shift,
            correlation: result.correlation(),
            key: result.key(),
        }))
    }

    /// Build edges from `results`, recording every skipped entry.
    ///
    /// Data errors are logged at `warn`; links leading out of the selection
    /// or between incomparable nodes only at `debug`.
    pub fn edges<'a>(&self, results: impl IntoIterator<Item = &'a PairwiseResult>) -> EdgeSet {
        let mut set = EdgeSet::default();
        for result in results {
            match self.edge(result) {
                Ok(Some(edge)) => set.edges.push(edge),
                Ok(None) => {}
                Err(reason) => {
                    if reason.is_data_error() {
                        tracing::warn!(pair = %result.key(), %reason, "skipping link");
                    } else {
                        tracing::debug!(pair = %result.key(), %reason, "skipping link");
                    }
                    set.skipped.push(SkippedLink {
                        key: result.key(),
                        reason,
                    });
                }
            }
        }
        set
    }
}

/// The registry pairs that would become edges for `selection`.
///
/// This is the natural candidate set for
/// [`FilterPipeline::apply_to_subset`](crate::FilterPipeline::apply_to_subset):
/// committing a filter over it never touches links outside the active
/// selection.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownView`] if a selected view is not in the
/// catalog.
pub fn candidate_pairs(
    context: &StitchingContext,
    selection: &SelectionConfig,
) -> Result<BTreeSet<PairKey>, ConfigError> {
    let graph = NodeGraph::build(selection, context.catalog())?;
    Ok(context.registry().with_results(|map| {
        map.iter()
            .filter(|(_, r)| matches!(graph.edge(r), Ok(Some(_))))
            .map(|(k, _)| k.clone())
            .collect()
    }))
}
