//! Integration tests: synthetic tile grids through filtering and global
//! optimization.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra::Vector3;
use tilestitch_core::{
    AffineTransform, Axis, ConfigError, GlobalOptConfig, GlobalOptimizer, Group, LinkPruning,
    OptimizeError, OptimizerConfig, PairKey, PairwiseResult, ResultFilter, ResultRegistry,
    RunState, SelectionConfig, SolveError, SolverKind, StitchingContext, TransformChain, View,
    ViewAttributes, ViewCatalog, ViewRegistrations, candidate_pairs, link_residual,
};

const SPACING: f64 = 100.0;

/// Ground-truth position of every tile.
type Truth = BTreeMap<u32, Vector3<f64>>;

fn grid_truth(rows: u32, cols: u32) -> Truth {
    (0..rows)
        .flat_map(|r| (0..cols).map(move |c| (r, c)))
        .map(|(r, c)| {
            (
                r * cols + c,
                Vector3::new(f64::from(c) * SPACING, f64::from(r) * SPACING, 0.0),
            )
        })
        .collect()
}

fn grid_neighbours(rows: u32, cols: u32) -> Vec<(u32, u32)> {
    let mut pairs = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            let tile = r * cols + c;
            if c + 1 < cols {
                pairs.push((tile, tile + 1));
            }
            if r + 1 < rows {
                pairs.push((tile, tile + cols));
            }
        }
    }
    pairs
}

/// Deterministic stage error of a tile's nominal placement.
fn stage_error(tile: u32, timepoint: u32) -> Vector3<f64> {
    Vector3::new(
        f64::from((tile * 7 + timepoint * 3) % 11) - 5.0,
        f64::from((tile * 5 + timepoint) % 7) - 3.0,
        0.0,
    )
}

/// One view per tile and timepoint (setup id = tile id), placed at the
/// truth plus a stage error, with no results yet.
fn dataset(truth: &Truth, timepoints: u32) -> StitchingContext {
    let mut catalog = ViewCatalog::new();
    let registrations = ViewRegistrations::new();
    for tp in 0..timepoints {
        for (&tile, position) in truth {
            let view = View::new(tp, tile);
            catalog.insert(view, ViewAttributes::tile(tile));
            registrations.insert(
                view,
                TransformChain::new()
                    .with("calibration", AffineTransform::scaling(1.0, 1.0, 2.0))
                    .with(
                        "translation",
                        AffineTransform::from_translation(position + stage_error(tile, tp)),
                    ),
            );
        }
    }
    StitchingContext::new(
        Arc::new(catalog),
        Arc::new(ResultRegistry::new()),
        Arc::new(registrations),
    )
}

fn link(tp: u32, a: u32, b: u32, shift: Vector3<f64>, r: f64) -> PairwiseResult {
    PairwiseResult::translation(
        Group::single(View::new(tp, a)),
        Group::single(View::new(tp, b)),
        shift,
        r,
    )
    .unwrap()
}

fn add_true_links(context: &StitchingContext, truth: &Truth, pairs: &[(u32, u32)], tp: u32) {
    for &(a, b) in pairs {
        context
            .registry()
            .put(link(tp, a, b, truth[&b] - truth[&a], 0.9));
    }
}

fn key(tp: u32, a: u32, b: u32) -> PairKey {
    PairKey::new(
        Group::single(View::new(tp, a)),
        Group::single(View::new(tp, b)),
    )
    .unwrap()
}

fn position(context: &StitchingContext, view: View) -> Vector3<f64> {
    context.registrations().global(&view).unwrap().translation
}

fn selection_at(truth: &Truth, tp: u32) -> SelectionConfig {
    SelectionConfig::new(truth.keys().map(|&tile| View::new(tp, tile)))
}

fn direct() -> OptimizerConfig {
    OptimizerConfig {
        solver: SolverKind::Direct,
        pruning: None,
        ..OptimizerConfig::default()
    }
}

/// Every tile sits at its truth offset from `reference`.
fn assert_reproduced(context: &StitchingContext, truth: &Truth, tiles: &[u32], reference: u32) {
    let origin = position(context, View::new(0, reference));
    for &tile in tiles {
        let got = position(context, View::new(0, tile)) - origin;
        let want = truth[&tile] - truth[&reference];
        assert!(
            (got - want).norm() < 1e-6,
            "tile {tile}: got {got:?}, want {want:?}"
        );
    }
}

#[test]
fn two_by_two_grid_is_reproduced() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    let anchor_before = position(&context, View::new(0, 0));

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let optimizer = GlobalOptimizer::new(context.clone(), config);
    let report = optimizer.run().unwrap();

    assert_eq!(optimizer.state(), RunState::Succeeded);
    assert_eq!(report.node_count, 4);
    assert_eq!(report.links.len(), 4);
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.corrections.len(), 4);
    assert_reproduced(&context, &truth, &[0, 1, 2, 3], 0);
    assert_eq!(position(&context, View::new(0, 0)), anchor_before);

    // Calibration is untouched and the correction is the trailing entry.
    let chain = context.registrations().chain(&View::new(0, 3)).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.entries()[0].name, "calibration");
    assert!(chain.stitching().is_some());

    // Every link now agrees with the placement.
    for tile in 0..4 {
        let stats = context
            .registry()
            .error_statistics(&View::new(0, tile), |r| {
                link_residual(context.registrations(), r)
            })
            .unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.max < 1e-6);
    }
}

#[test]
fn relaxation_reproduces_grid() {
    let truth = grid_truth(3, 3);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(3, 3), 0);

    let config = GlobalOptConfig {
        optimizer: OptimizerConfig {
            solver: SolverKind::Relaxation {
                max_iterations: 100_000,
                tolerance: 1e-10,
            },
            pruning: None,
            ..OptimizerConfig::default()
        },
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    GlobalOptimizer::new(context.clone(), config).run().unwrap();
    assert_reproduced(&context, &truth, &(0..9).collect::<Vec<_>>(), 0);
}

#[test]
fn spurious_link_is_removed_by_filter_commit() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    context
        .registry()
        .put(link(0, 0, 3, Vector3::new(180.0, 20.0, 0.0), 0.1));
    // A link outside the selection that would also fail the filter.
    context.registry().put(link(7, 0, 1, Vector3::zeros(), 0.05));

    let selection = selection_at(&truth, 0);
    let mut pipeline = context.pipeline(Default::default());
    pipeline.add_filter(ResultFilter::correlation(0.5, 1.0).unwrap());
    assert_eq!(pipeline.rejected_results().len(), 2);

    let candidates = candidate_pairs(&context, &selection).unwrap();
    assert_eq!(candidates.len(), 5);
    let removed = pipeline.apply_to_subset(&candidates);
    assert_eq!(removed, vec![key(0, 0, 3)]);
    assert!(context.registry().contains(&key(7, 0, 1)));

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection)
    };
    let report = GlobalOptimizer::new(context.clone(), config).run().unwrap();
    assert_eq!(report.links.len(), 4);
    assert_reproduced(&context, &truth, &[0, 1, 2, 3], 0);
}

#[test]
fn spurious_grid_link_is_removed_and_tree_reproduces_grid() {
    // One of the four neighbour links (1 -> 3) is a bad low-correlation match.
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &[(0, 1), (0, 2), (2, 3)], 0);
    context
        .registry()
        .put(link(0, 1, 3, Vector3::new(37.0, -12.0, 0.0), 0.1));

    let selection = selection_at(&truth, 0);
    let mut pipeline = context.pipeline(Default::default());
    pipeline.add_filter(ResultFilter::correlation(0.5, 1.0).unwrap());
    let candidates = candidate_pairs(&context, &selection).unwrap();
    assert_eq!(candidates.len(), 4);
    assert_eq!(pipeline.apply_to_subset(&candidates), vec![key(0, 1, 3)]);
    assert_eq!(context.registry().len(), 3);

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection)
    };
    let report = GlobalOptimizer::new(context.clone(), config).run().unwrap();
    assert_eq!(report.links.len(), 3);
    assert_eq!(report.components.len(), 1);

    let diagonal = position(&context, View::new(0, 3)) - position(&context, View::new(0, 0));
    assert!((diagonal - Vector3::new(SPACING, SPACING, 0.0)).norm() < 1e-6);
    assert_reproduced(&context, &truth, &[0, 1, 2, 3], 0);
}

#[test]
fn optimizer_filters_without_mutating_registry() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    context
        .registry()
        .put(link(0, 0, 3, Vector3::new(180.0, 20.0, 0.0), 0.1));

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let filters = [ResultFilter::correlation(0.5, 1.0).unwrap()]
        .into_iter()
        .collect();
    let report = GlobalOptimizer::new(context.clone(), config)
        .with_filters(filters)
        .run()
        .unwrap();
    assert_eq!(report.links.len(), 4);
    assert_eq!(context.registry().len(), 5);
    assert_reproduced(&context, &truth, &[0, 1, 2, 3], 0);
}

#[test]
fn node_without_links_keeps_its_placement() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    let removed = context
        .registry()
        .remove_touching(&BTreeSet::from([View::new(0, 3)]));
    assert_eq!(removed.len(), 2);
    let isolated = context.registrations().chain(&View::new(0, 3)).unwrap();

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let report = GlobalOptimizer::new(context.clone(), config).run().unwrap();

    assert_eq!(
        context.registrations().chain(&View::new(0, 3)).unwrap(),
        isolated
    );
    assert!(
        report
            .corrections
            .iter()
            .all(|c| !c.views.contains(&View::new(0, 3)))
    );
    assert_reproduced(&context, &truth, &[0, 1, 2], 0);
}

#[test]
fn single_node_is_a_noop() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    let before = context.registrations().snapshot();

    let config = GlobalOptConfig::new(SelectionConfig::new([View::new(0, 2)]));
    let optimizer = GlobalOptimizer::new(context.clone(), config);
    let report = optimizer.run().unwrap();

    assert_eq!(optimizer.state(), RunState::Succeeded);
    assert_eq!(report.node_count, 1);
    assert_eq!(report.diagnostics.node_count, 1);
    assert!(!report.committed());
    assert_eq!(context.registrations().snapshot(), before);
}

#[test]
fn empty_selection_fails_before_any_work() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    let before = context.registrations().snapshot();

    let optimizer = GlobalOptimizer::new(
        context.clone(),
        GlobalOptConfig::new(SelectionConfig::new(Vec::<View>::new())),
    );
    let err = optimizer.run().unwrap_err();
    assert_eq!(err, OptimizeError::Config(ConfigError::EmptySelection));
    assert_eq!(optimizer.state(), RunState::Failed);
    assert_eq!(context.registrations().snapshot(), before);
}

#[test]
fn disconnected_components_are_solved_independently() {
    // Tiles 0-1 and 2-3 are linked within but not across pairs.
    let truth = grid_truth(2, 2);
    let pairs = [(0, 1), (2, 3)];

    let together = dataset(&truth, 1);
    add_true_links(&together, &truth, &pairs, 0);
    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let report = GlobalOptimizer::new(together.clone(), config).run().unwrap();
    assert_eq!(report.components.len(), 2);

    let alone = dataset(&truth, 1);
    add_true_links(&alone, &truth, &pairs[1..], 0);
    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(SelectionConfig::new([
            View::new(0, 2),
            View::new(0, 3),
        ]))
    };
    GlobalOptimizer::new(alone.clone(), config).run().unwrap();

    for tile in [2, 3] {
        let view = View::new(0, tile);
        assert!((position(&together, view) - position(&alone, view)).norm() < 1e-9);
    }
    assert_reproduced(&together, &truth, &[0, 1], 0);
    assert_reproduced(&together, &truth, &[2, 3], 2);
}

#[test]
fn numerical_failure_in_one_component_commits_nothing() {
    // Tiles 0-1 form a pair that relaxes in two sweeps; tiles 2..=5 form a
    // square that does not.
    let mut truth = Truth::new();
    truth.insert(0, Vector3::new(0.0, 0.0, 0.0));
    truth.insert(1, Vector3::new(SPACING, 0.0, 0.0));
    for (i, (x, y)) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
        .into_iter()
        .enumerate()
    {
        let tile = 2 + u32::try_from(i).unwrap();
        truth.insert(tile, Vector3::new(1000.0 + x * SPACING, y * SPACING, 0.0));
    }
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &[(0, 1), (2, 3), (4, 5), (2, 4), (3, 5)], 0);
    let before = context.registrations().snapshot();

    let config = GlobalOptConfig {
        optimizer: OptimizerConfig {
            solver: SolverKind::Relaxation {
                max_iterations: 2,
                tolerance: 1e-9,
            },
            pruning: None,
            ..OptimizerConfig::default()
        },
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let optimizer = GlobalOptimizer::new(context.clone(), config);
    let err = optimizer.run().unwrap_err();

    assert!(matches!(
        err,
        OptimizeError::Numerical(SolveError::NotConverged { component: 1, .. })
    ));
    assert_eq!(optimizer.state(), RunState::Failed);
    assert_eq!(context.registrations().snapshot(), before);
}

#[test]
fn cancelled_run_commits_nothing() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    let before = context.registrations().snapshot();

    let optimizer =
        GlobalOptimizer::new(context.clone(), GlobalOptConfig::new(selection_at(&truth, 0)));
    let observer = optimizer.clone();
    optimizer.cancel_token().cancel();
    let handle = optimizer.spawn().unwrap();
    assert_eq!(handle.join().unwrap_err(), OptimizeError::Cancelled);

    assert_eq!(observer.state(), RunState::Cancelled);
    assert!(!context.is_running());
    assert_eq!(context.registrations().snapshot(), before);
}

#[test]
fn background_run_reports_through_handle() {
    let truth = grid_truth(3, 4);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(3, 4), 0);

    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let handle = GlobalOptimizer::new(context.clone(), config).spawn().unwrap();
    let report = handle.join().unwrap();
    assert_eq!(report.corrections.len(), 12);
    assert!(!context.is_running());
    assert_reproduced(&context, &truth, &(0..12).collect::<Vec<_>>(), 0);
}

#[test]
fn pruning_drops_a_bad_link_that_passes_filters() {
    let truth = grid_truth(5, 5);
    let context = dataset(&truth, 1);
    let pairs = grid_neighbours(5, 5);
    add_true_links(&context, &truth, &pairs, 0);
    // interior link (tile 11 -> 12) measured 40 units off, with high correlation
    context
        .registry()
        .put(link(0, 11, 12, Vector3::new(SPACING + 40.0, 0.0, 0.0), 0.95));

    let config = GlobalOptConfig {
        optimizer: OptimizerConfig {
            solver: SolverKind::Direct,
            pruning: Some(LinkPruning::default()),
            ..OptimizerConfig::default()
        },
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let report = GlobalOptimizer::new(context.clone(), config).run().unwrap();

    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].key, key(0, 11, 12));
    // pruning never deletes from the registry
    assert!(context.registry().contains(&key(0, 11, 12)));
    assert_reproduced(&context, &truth, &(0..25).collect::<Vec<_>>(), 0);
}

#[test]
fn application_axis_replicates_one_correction() {
    let truth = grid_truth(1, 2);
    let context = dataset(&truth, 2);
    // Links are only measured at timepoint 0.
    add_true_links(&context, &truth, &[(0, 1)], 0);
    let tp1_before = position(&context, View::new(1, 1));

    let selection = SelectionConfig::new(context.catalog().views().copied())
        .with_application([Axis::Timepoint]);
    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection)
    };
    let report = GlobalOptimizer::new(context.clone(), config).run().unwrap();
    assert_eq!(report.node_count, 2);

    let correction = |view: View| {
        *context
            .registrations()
            .chain(&view)
            .unwrap()
            .stitching()
            .unwrap()
    };
    assert_eq!(correction(View::new(0, 1)), correction(View::new(1, 1)));
    assert_eq!(correction(View::new(0, 0)), correction(View::new(1, 0)));

    let moved = position(&context, View::new(1, 1)) - tp1_before;
    assert!((moved - correction(View::new(0, 1)).translation).norm() < 1e-9);
    assert_reproduced(&context, &truth, &[0, 1], 0);
}

#[test]
fn rerun_replaces_rather_than_stacks_corrections() {
    let truth = grid_truth(2, 2);
    let context = dataset(&truth, 1);
    add_true_links(&context, &truth, &grid_neighbours(2, 2), 0);
    let config = GlobalOptConfig {
        optimizer: direct(),
        ..GlobalOptConfig::new(selection_at(&truth, 0))
    };
    let optimizer = GlobalOptimizer::new(context.clone(), config);
    optimizer.run().unwrap();
    let first = context.registrations().snapshot();

    let report = optimizer.run().unwrap();
    assert!(report.max_correction() < 1e-6);
    for (view, chain) in context.registrations().snapshot() {
        assert_eq!(chain.len(), 3);
        assert!(chain.global().approx_eq(&first[&view].global(), 1e-6));
    }
}
