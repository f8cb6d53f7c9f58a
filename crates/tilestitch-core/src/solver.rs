//! Weighted least-squares placement of nodes from pairwise shifts.
//!
//! Every edge `from -> to` with measured shift `t` and weight `w`
//! contributes `w * ‖x_to - x_from - t‖²` to the objective. The graph is
//! split into connected components with a union-find; each component is
//! solved on its own with its lowest node held at its current placement.
//! Nodes without edges are never moved.
//!
//! Only the translation part of a measurement enters the objective.

use nalgebra::{DMatrix, Vector3};
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::config::{EdgeWeighting, LinkPruning, OptimizerConfig, SolverKind};
use crate::context::CancelToken;
use crate::grouping::{Edge, NodeId};
use crate::pairwise::PairKey;
use crate::types::SolveError;

/// Summary of one solved component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    /// Nodes of the component, ascending.
    pub nodes: Vec<NodeId>,
    /// The node held fixed.
    pub anchor: NodeId,
    /// Edges used in the final solve.
    pub edges: usize,
    /// Solver iterations of the final solve (1 for the direct solver).
    pub iterations: usize,
    /// Mean edge residual after the final solve.
    pub mean_residual: f64,
    /// Largest edge residual after the final solve.
    pub max_residual: f64,
}

/// An edge dropped by [`LinkPruning`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunedLink {
    /// The registry entry behind the edge.
    pub key: PairKey,
    /// Its residual when it was dropped.
    pub residual: f64,
    /// Index of the component it belonged to.
    pub component: usize,
}

/// Solved positions of every node.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// One position per node; nodes outside multi-node components keep
    /// their input placement.
    pub positions: Vec<Vector3<f64>>,
    /// One report per multi-node component, ordered by lowest node.
    pub components: Vec<ComponentReport>,
    /// Edges dropped by pruning.
    pub pruned: Vec<PrunedLink>,
}

/// Connected components of `node_count` nodes under `edges`, each sorted
/// ascending, ordered by their lowest node.
#[must_use]
pub fn components(node_count: usize, edges: &[Edge]) -> Vec<Vec<usize>> {
    connected(node_count, edges.iter())
}

fn connected<'a>(node_count: usize, edges: impl Iterator<Item = &'a Edge>) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::<usize>::new(node_count);
    for edge in edges {
        uf.union(edge.from.0, edge.to.0);
    }
    let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for node in 0..node_count {
        by_root[uf.find_mut(node)].push(node);
    }
    let mut components: Vec<Vec<usize>> = by_root.into_iter().filter(|c| !c.is_empty()).collect();
    components.sort_by_key(|c| c.first().copied());
    components
}

/// Solve every component of the graph.
///
/// `placements` holds the current position of each node and determines
/// the node count. Fails as a whole if any component fails.
///
/// # Errors
///
/// Returns [`SolveError::Cancelled`] once `cancel` fires (checked between
/// components, pruning rounds and relaxation iterations), or the first
/// numerical failure of any component.
pub fn solve(
    placements: &[Vector3<f64>],
    edges: &[Edge],
    config: &OptimizerConfig,
    cancel: &CancelToken,
) -> Result<Solution, SolveError> {
    let mut solution = Solution {
        positions: placements.to_vec(),
        components: Vec::new(),
        pruned: Vec::new(),
    };

    let multi: Vec<Vec<usize>> = components(placements.len(), edges)
        .into_iter()
        .filter(|c| c.len() > 1)
        .collect();

    for (index, nodes) in multi.into_iter().enumerate() {
        cancel.check()?;
        let component_edges: Vec<&Edge> = edges
            .iter()
            .filter(|e| nodes.binary_search(&e.from.0).is_ok())
            .collect();
        let report = solve_component(
            index,
            &nodes,
            component_edges,
            placements,
            config,
            cancel,
            &mut solution,
        )?;
        tracing::debug!(
            component = index,
            nodes = report.nodes.len(),
            edges = report.edges,
            iterations = report.iterations,
            mean_residual = report.mean_residual,
            max_residual = report.max_residual,
            "solved component"
        );
        solution.components.push(report);
    }

    Ok(solution)
}

/// Solve one component, pruning its worst links if configured.
fn solve_component(
    index: usize,
    nodes: &[usize],
    mut active: Vec<&Edge>,
    placements: &[Vector3<f64>],
    config: &OptimizerConfig,
    cancel: &CancelToken,
    solution: &mut Solution,
) -> Result<ComponentReport, SolveError> {
    let mut dropped = 0;
    loop {
        cancel.check()?;
        let (positions, iterations) = solve_forest(index, nodes, &active, placements, config, cancel)?;
        let residuals: Vec<f64> = active
            .iter()
            .map(|e| residual(e, &positions))
            .collect();

        if let Some(pruning) = config.pruning
            && dropped < pruning.max_rounds
            && let Some(worst) = worst_link(&residuals, &pruning)
        {
            let edge = active.remove(worst);
            tracing::info!(
                component = index,
                pair = %edge.key,
                residual = residuals[worst],
                "pruning link"
            );
            solution.pruned.push(PrunedLink {
                key: edge.key.clone(),
                residual: residuals[worst],
                component: index,
            });
            dropped += 1;
            continue;
        }

        for &node in nodes {
            solution.positions[node] = positions[node];
        }
        #[allow(clippy::cast_precision_loss)]
        let mean_residual = if residuals.is_empty() {
            0.0
        } else {
            residuals.iter().sum::<f64>() / residuals.len() as f64
        };
        return Ok(ComponentReport {
            nodes: nodes.iter().copied().map(NodeId).collect(),
            anchor: NodeId(nodes[0]),
            edges: active.len(),
            iterations,
            mean_residual,
            max_residual: residuals.iter().copied().fold(0.0, f64::max),
        });
    }
}

/// Index of the link to drop, if any exceeds both thresholds.
fn worst_link(residuals: &[f64], pruning: &LinkPruning) -> Option<usize> {
    if residuals.len() < 2 {
        return None;
    }
    let (worst, max) = residuals
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    #[allow(clippy::cast_precision_loss)]
    let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
    (max > pruning.absolute_threshold && max > pruning.relative_threshold * mean).then_some(worst)
}

fn residual(edge: &Edge, positions: &[Vector3<f64>]) -> f64 {
    (positions[edge.to.0] - positions[edge.from.0] - edge.shift).norm()
}

/// Solve `nodes` under `edges`, which may have split the original
/// component apart. Every sub-component is anchored at its lowest node.
///
/// Returns full-length positions (only `nodes` entries are meaningful) and
/// the largest iteration count of any sub-component.
fn solve_forest(
    index: usize,
    nodes: &[usize],
    edges: &[&Edge],
    placements: &[Vector3<f64>],
    config: &OptimizerConfig,
    cancel: &CancelToken,
) -> Result<(Vec<Vector3<f64>>, usize), SolveError> {
    let mut positions = placements.to_vec();
    let mut iterations = 0;
    for sub in connected(placements.len(), edges.iter().copied())
        .into_iter()
        .filter(|c| c.len() > 1 && nodes.binary_search(&c[0]).is_ok())
    {
        let sub_edges: Vec<&Edge> = edges
            .iter()
            .copied()
            .filter(|e| sub.binary_search(&e.from.0).is_ok())
            .collect();
        let system = System::new(&sub, &sub_edges, placements, config.weighting);
        let (solved, n) = match config.solver {
            SolverKind::Direct => (system.solve_direct(index)?, 1),
            SolverKind::Relaxation {
                max_iterations,
                tolerance,
            } => system.solve_relaxation(index, max_iterations, tolerance, cancel)?,
        };
        for (local, position) in solved.into_iter().enumerate() {
            positions[sub[local]] = position;
        }
        iterations = iterations.max(n);
    }
    Ok((positions, iterations))
}

/// One connected component in local numbering; local node 0 is the anchor.
struct System {
    /// Current placement per local node.
    start: Vec<Vector3<f64>>,
    /// `(from, to, shift, weight)` in local numbering.
    links: Vec<(usize, usize, Vector3<f64>, f64)>,
}

impl System {
    fn new(
        nodes: &[usize],
        edges: &[&Edge],
        placements: &[Vector3<f64>],
        weighting: EdgeWeighting,
    ) -> Self {
        let local = |global: usize| nodes.binary_search(&global).unwrap_or(0);
        Self {
            start: nodes.iter().map(|&n| placements[n]).collect(),
            links: edges
                .iter()
                .map(|e| {
                    (
                        local(e.from.0),
                        local(e.to.0),
                        e.shift,
                        weighting.weight(e.correlation),
                    )
                })
                .collect(),
        }
    }

    /// Cholesky solve of the anchored normal equations.
    fn solve_direct(&self, component: usize) -> Result<Vec<Vector3<f64>>, SolveError> {
        let n = self.start.len();
        let unknowns = n - 1;
        let anchor = self.start[0];
        let mut a = DMatrix::<f64>::zeros(unknowns, unknowns);
        let mut b = DMatrix::<f64>::zeros(unknowns, 3);

        for &(from, to, shift, w) in &self.links {
            match (from, to) {
                (0, 0) => {}
                (0, j) => {
                    a[(j - 1, j - 1)] += w;
                    add_row(&mut b, j - 1, &((shift + anchor) * w));
                }
                (i, 0) => {
                    a[(i - 1, i - 1)] += w;
                    add_row(&mut b, i - 1, &((anchor - shift) * w));
                }
                (i, j) => {
                    let (i, j) = (i - 1, j - 1);
                    a[(i, i)] += w;
                    a[(j, j)] += w;
                    a[(i, j)] -= w;
                    a[(j, i)] -= w;
                    add_row(&mut b, j, &(shift * w));
                    add_row(&mut b, i, &(-shift * w));
                }
            }
        }

        let cholesky = a.cholesky().ok_or(SolveError::Singular { component })?;
        let x = cholesky.solve(&b);
        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::NonFinite { component });
        }

        let mut positions = Vec::with_capacity(n);
        positions.push(anchor);
        for row in 0..unknowns {
            positions.push(Vector3::new(x[(row, 0)], x[(row, 1)], x[(row, 2)]));
        }
        Ok(positions)
    }

    /// Gauss-Seidel sweeps from the current placements.
    fn solve_relaxation(
        &self,
        component: usize,
        max_iterations: usize,
        tolerance: f64,
        cancel: &CancelToken,
    ) -> Result<(Vec<Vector3<f64>>, usize), SolveError> {
        let n = self.start.len();
        let mut incident: Vec<Vec<(usize, Vector3<f64>, f64)>> = vec![Vec::new(); n];
        for &(from, to, shift, w) in &self.links {
            // neighbour, predicted offset from the neighbour, weight
            incident[to].push((from, shift, w));
            incident[from].push((to, -shift, w));
        }

        let mut x = self.start.clone();
        let mut last_update = f64::INFINITY;
        for iteration in 1..=max_iterations {
            cancel.check()?;
            last_update = 0.0;
            for node in 1..n {
                let mut sum = Vector3::zeros();
                let mut total = 0.0;
                for &(other, offset, w) in &incident[node] {
                    sum += (x[other] + offset) * w;
                    total += w;
                }
                if total <= 0.0 {
                    continue;
                }
                let next = sum / total;
                last_update = last_update.max((next - x[node]).norm());
                x[node] = next;
            }
            if !last_update.is_finite() {
                return Err(SolveError::NonFinite { component });
            }
            if last_update < tolerance {
                return Ok((x, iteration));
            }
        }
        Err(SolveError::NotConverged {
            component,
            iterations: max_iterations,
            last_update,
        })
    }
}

fn add_row(b: &mut DMatrix<f64>, row: usize, value: &Vector3<f64>) {
    for col in 0..3 {
        b[(row, col)] += value[col];
    }
}
