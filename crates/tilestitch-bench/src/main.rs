//! tilestitch-bench: CLI tool for filter and optimizer experimentation.
//!
//! Builds a dataset (a synthetic tile grid or a JSON scenario file), runs
//! result filtering and global optimization on it, and prints per-stage
//! diagnostics. Useful for:
//!
//! - Tuning correlation and shift filters against spurious links
//! - Comparing the direct and relaxation solvers
//! - Checking how link pruning copes with gross outliers
//! - Measuring per-stage durations on large grids
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin tilestitch-bench -- [OPTIONS]
//! ```
//!
//! Logging honours `RUST_LOG` (default `info`) and goes to stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tilestitch_core::{
    AffineTransform, Axis, EdgeWeighting, FilterSet, GlobalOptConfig, GlobalOptimizer, Group,
    LinkPruning, OptimizationDiagnostics, OptimizationReport, OptimizerConfig, PairwiseResult,
    ResultFilter, ResultRegistry, SelectionConfig, SolverKind, StitchingContext, TransformChain,
    View, ViewAttributes, ViewCatalog, ViewRegistrations, candidate_pairs, link_residual,
};
use tracing_subscriber::EnvFilter;

/// Filter and optimizer experimentation for tilestitch.
///
/// Generates a grid of overlapping tiles with stage error, noisy pairwise
/// measurements and optional bad links (or loads a scenario file), then
/// filters, optimizes and reports.
#[derive(Parser)]
#[command(name = "tilestitch-bench", version)]
struct Cli {
    /// Load the dataset from a JSON scenario file instead of generating one.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Grid rows.
    #[arg(long, default_value_t = 4, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    rows: u32,

    /// Grid columns.
    #[arg(long, default_value_t = 4, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    cols: u32,

    /// Timepoints; every timepoint is measured separately.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    timepoints: u32,

    /// Tile pitch in global units.
    #[arg(long, default_value_t = 100.0)]
    spacing: f64,

    /// Largest per-axis error of a tile's nominal stage position.
    #[arg(long, default_value_t = 5.0)]
    stage_error: f64,

    /// Largest per-axis error of a pairwise measurement.
    #[arg(long, default_value_t = 0.2)]
    noise: f64,

    /// Number of low-correlation diagonal links with arbitrary shifts.
    #[arg(long, default_value_t = 0)]
    spurious: usize,

    /// Number of neighbour links replaced by a high-correlation gross error.
    #[arg(long, default_value_t = 0)]
    outliers: usize,

    /// Seed of the synthetic dataset.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write the dataset as a JSON scenario file.
    #[arg(long)]
    export_scenario: Option<PathBuf>,

    /// Drop links whose correlation is below this value.
    #[arg(long)]
    min_correlation: Option<f64>,

    /// Drop links whose shift magnitude exceeds this value.
    #[arg(long)]
    max_shift: Option<f64>,

    /// Remove filtered links from the registry before optimizing, instead
    /// of only ignoring them during the run.
    #[arg(long)]
    commit: bool,

    /// Treat all channels and illuminations of a tile as one node.
    #[arg(long)]
    group_channels: bool,

    /// Solve timepoint 0 and apply its corrections to every timepoint.
    #[arg(long)]
    share_timepoints: bool,

    /// Linear solver.
    #[arg(long, value_enum, default_value_t = Solver::Direct)]
    solver: Solver,

    /// Sweep limit of the relaxation solver.
    #[arg(long, default_value_t = 10_000)]
    max_iterations: usize,

    /// Convergence tolerance of the relaxation solver.
    #[arg(long, default_value_t = 1e-6)]
    tolerance: f64,

    /// Link weighting.
    #[arg(long, value_enum, default_value_t = Weighting::Correlation)]
    weighting: Weighting,

    /// Drop links that disagree with the solved placement.
    #[arg(long)]
    prune: bool,

    /// Pruning: worst-to-mean residual ratio that drops a link (implies
    /// `--prune`).
    #[arg(long)]
    prune_relative: Option<f64>,

    /// Pruning: residual below which no link is dropped (implies `--prune`).
    #[arg(long)]
    prune_absolute: Option<f64>,

    /// Full optimizer config as a JSON string.
    ///
    /// When provided, the solver, weighting and pruning flags are ignored.
    /// The JSON must be a valid `OptimizerConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Number of runs for averaging. Every run starts from the same dataset.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output reports as JSON instead of human-readable text.
    #[arg(long)]
    json: bool,
}

/// Solver selection.
#[derive(Clone, Copy, ValueEnum)]
enum Solver {
    /// Cholesky factorization of the normal equations.
    Direct,
    /// Gauss-Seidel sweeps from the current placement.
    Relaxation,
}

/// Link weighting selection.
#[derive(Clone, Copy, ValueEnum)]
enum Weighting {
    /// Every link counts the same.
    Uniform,
    /// Links weigh their correlation.
    Correlation,
}

/// One view of a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioView {
    view: View,
    #[serde(default)]
    attributes: ViewAttributes,
    chain: TransformChain,
    /// Known true position, if the scenario is synthetic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    truth: Option<[f64; 3]>,
}

/// A complete in-memory dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scenario {
    views: Vec<ScenarioView>,
    results: Vec<PairwiseResult>,
}

impl Scenario {
    fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("Error parsing {}: {e}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Error serializing scenario: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Error writing {}: {e}", path.display()))
    }

    /// A fresh context holding this dataset.
    fn context(&self) -> StitchingContext {
        let catalog: ViewCatalog = self.views.iter().map(|v| (v.view, v.attributes)).collect();
        let registrations = ViewRegistrations::new();
        for v in &self.views {
            registrations.insert(v.view, v.chain.clone());
        }
        let registry = ResultRegistry::new();
        registry.extend(self.results.iter().cloned());
        StitchingContext::new(
            Arc::new(catalog),
            Arc::new(registry),
            Arc::new(registrations),
        )
    }

    fn synthetic(cli: &Cli) -> Result<Self, String> {
        for (flag, amplitude) in [
            ("--spacing", cli.spacing),
            ("--stage-error", cli.stage_error),
            ("--noise", cli.noise),
        ] {
            if !amplitude.is_finite() || amplitude < 0.0 {
                return Err(format!(
                    "{flag} must be a finite non-negative number, got {amplitude}"
                ));
            }
        }
        let (rows, cols) = (cli.rows, cli.cols);
        let tiles = rows
            .checked_mul(cols)
            .ok_or_else(|| format!("A {rows} x {cols} grid has too many tiles"))?;
        let mut rng = StdRng::seed_from_u64(cli.seed);
        let truth = |tile: u32| {
            [
                f64::from(tile % cols) * cli.spacing,
                f64::from(tile / cols) * cli.spacing,
                0.0,
            ]
        };

        let mut views = Vec::new();
        let mut results = Vec::new();
        for tp in 0..cli.timepoints {
            for tile in 0..tiles {
                let [x, y, z] = truth(tile);
                let nominal = AffineTransform::translation_xyz(
                    x + jitter(&mut rng, cli.stage_error),
                    y + jitter(&mut rng, cli.stage_error),
                    z,
                );
                views.push(ScenarioView {
                    view: View::new(tp, tile),
                    attributes: ViewAttributes::tile(tile),
                    chain: TransformChain::new().with("stage", nominal),
                    truth: Some([x, y, z]),
                });
            }

            let link = |a: u32, b: u32, error: [f64; 2], r: f64| {
                let (ta, tb) = (truth(a), truth(b));
                PairwiseResult::new(
                    Group::single(View::new(tp, a)),
                    Group::single(View::new(tp, b)),
                    AffineTransform::translation_xyz(
                        tb[0] - ta[0] + error[0],
                        tb[1] - ta[1] + error[1],
                        0.0,
                    ),
                    r,
                )
                .map_err(|e| format!("Error building link {a} -> {b}: {e}"))
            };

            let mut neighbours = Vec::new();
            for tile in 0..tiles {
                if tile % cols + 1 < cols {
                    neighbours.push((tile, tile + 1));
                }
                if tile / cols + 1 < rows {
                    neighbours.push((tile, tile + cols));
                }
            }
            for &(a, b) in &neighbours {
                let error = [jitter(&mut rng, cli.noise), jitter(&mut rng, cli.noise)];
                let r = rng.random_range(0.7..1.0);
                results.push(link(a, b, error, r)?);
            }

            if cli.outliers > 0 && !neighbours.is_empty() {
                for _ in 0..cli.outliers {
                    let (a, b) = neighbours[rng.random_range(0..neighbours.len())];
                    let gross = 0.2 * cli.spacing;
                    let error = [jitter(&mut rng, gross), gross];
                    results.push(link(a, b, error, 0.95)?);
                }
            }

            if cli.spurious > 0 {
                if rows < 2 || cols < 2 {
                    tracing::warn!("grid has no diagonals, no spurious links added");
                } else {
                    for _ in 0..cli.spurious {
                        let row = rng.random_range(0..rows - 1);
                        let col = rng.random_range(0..cols - 1);
                        let a = row * cols + col;
                        let error = [
                            jitter(&mut rng, cli.spacing),
                            jitter(&mut rng, cli.spacing),
                        ];
                        let r = rng.random_range(0.0..0.3);
                        results.push(link(a, a + cols + 1, error, r)?);
                    }
                }
            }
        }

        Ok(Self { views, results })
    }

    /// Largest distance of a view from its true position after removing
    /// the mean offset, over views with a known truth.
    #[allow(clippy::cast_precision_loss)]
    fn truth_error(&self, context: &StitchingContext) -> Option<f64> {
        let offsets: Vec<[f64; 3]> = self
            .views
            .iter()
            .filter_map(|v| {
                let truth = v.truth?;
                let placed = context.registrations().global(&v.view)?.translation;
                Some([
                    placed.x - truth[0],
                    placed.y - truth[1],
                    placed.z - truth[2],
                ])
            })
            .collect();
        if offsets.is_empty() {
            return None;
        }
        let n = offsets.len() as f64;
        let mean: [f64; 3] =
            std::array::from_fn(|i| offsets.iter().map(|o| o[i]).sum::<f64>() / n);
        offsets
            .iter()
            .map(|o| {
                (0..3)
                    .map(|i| (o[i] - mean[i]).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .reduce(f64::max)
    }
}

/// Uniform error in `[-amplitude, amplitude]`; zero for a non-positive
/// amplitude.
fn jitter(rng: &mut StdRng, amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rng.random_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}

/// Build the result filters from CLI arguments.
fn filters_from_cli(cli: &Cli) -> Result<FilterSet, String> {
    let mut filters = FilterSet::new();
    if let Some(min) = cli.min_correlation {
        filters.insert(
            ResultFilter::correlation(min, 1.0)
                .map_err(|e| format!("Invalid --min-correlation: {e}"))?,
        );
    }
    if let Some(max) = cli.max_shift {
        filters.insert(
            ResultFilter::shift_magnitude(max).map_err(|e| format!("Invalid --max-shift: {e}"))?,
        );
    }
    Ok(filters)
}

/// Build an [`OptimizerConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual solver flags are ignored.
fn optimizer_from_cli(cli: &Cli) -> Result<OptimizerConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    let prune = cli.prune || cli.prune_relative.is_some() || cli.prune_absolute.is_some();
    let pruning = prune.then(|| {
        let defaults = LinkPruning::default();
        LinkPruning {
            relative_threshold: cli.prune_relative.unwrap_or(defaults.relative_threshold),
            absolute_threshold: cli.prune_absolute.unwrap_or(defaults.absolute_threshold),
            ..defaults
        }
    });

    Ok(OptimizerConfig {
        solver: match cli.solver {
            Solver::Direct => SolverKind::Direct,
            Solver::Relaxation => SolverKind::Relaxation {
                max_iterations: cli.max_iterations,
                tolerance: cli.tolerance,
            },
        },
        weighting: match cli.weighting {
            Weighting::Uniform => EdgeWeighting::Uniform,
            Weighting::Correlation => EdgeWeighting::default(),
        },
        pruning,
    })
}

/// Build the view selection for a dataset.
fn selection_from_cli(cli: &Cli, context: &StitchingContext) -> SelectionConfig {
    let mut selection = SelectionConfig::new(context.catalog().views().copied());
    if cli.group_channels {
        selection = selection.with_grouping([Axis::Channel, Axis::Illumination]);
    }
    if cli.share_timepoints {
        selection = selection.with_application([Axis::Timepoint]);
    }
    selection
}

/// Outcome of one run.
struct RunOutcome {
    report: OptimizationReport,
    removed: usize,
    truth_error: Option<f64>,
    worst_link: Option<f64>,
}

fn run_once(
    cli: &Cli,
    scenario: &Scenario,
    filters: &FilterSet,
    optimizer: OptimizerConfig,
) -> Result<RunOutcome, String> {
    let context = scenario.context();
    let selection = selection_from_cli(cli, &context);

    let mut removed = 0;
    let run_filters = if cli.commit {
        let candidates = candidate_pairs(&context, &selection)
            .map_err(|e| format!("Invalid selection: {e}"))?;
        removed = context
            .pipeline(filters.clone())
            .apply_to_subset(&candidates)
            .len();
        FilterSet::new()
    } else {
        filters.clone()
    };

    let config = GlobalOptConfig {
        optimizer,
        ..GlobalOptConfig::new(selection)
    };
    let report = GlobalOptimizer::new(context.clone(), config)
        .with_filters(run_filters)
        .run()
        .map_err(|e| format!("Optimization error: {e}"))?;

    let pipeline = context.pipeline(filters.clone());
    let worst_link = pipeline
        .filtered_results()
        .values()
        .filter_map(|r| link_residual(context.registrations(), r))
        .reduce(f64::max);

    Ok(RunOutcome {
        truth_error: scenario.truth_error(&context),
        report,
        removed,
        worst_link,
    })
}

fn print_outcome(outcome: &RunOutcome) {
    let report = &outcome.report;
    println!("{}", report.diagnostics.report());
    println!();
    if outcome.removed > 0 {
        println!("Links removed by filters: {}", outcome.removed);
    }
    println!(
        "Links used: {}  |  Skipped: {}  |  Pruned: {}",
        report.links.len(),
        report.skipped.len(),
        report.pruned.len(),
    );
    for pruned in &report.pruned {
        println!("  pruned {} (residual {:.3})", pruned.key, pruned.residual);
    }
    println!("Max correction: {:.3}", report.max_correction());
    if let Some(worst) = outcome.worst_link {
        println!("Worst remaining link residual: {worst:.3}");
    }
    if let Some(err) = outcome.truth_error {
        println!("Max placement error vs truth: {err:.3}");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let prepared = filters_from_cli(&cli).and_then(|filters| {
        let optimizer = optimizer_from_cli(&cli)?;
        let scenario = match cli.scenario {
            Some(ref path) => Scenario::load(path)?,
            None => Scenario::synthetic(&cli)?,
        };
        Ok((filters, optimizer, scenario))
    });
    let (filters, optimizer, scenario) = match prepared {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(ref path) = cli.export_scenario {
        match scenario.save(path) {
            Ok(()) => eprintln!("Scenario written to {}", path.display()),
            Err(msg) => eprintln!("{msg}"),
        }
    }

    eprintln!(
        "Dataset: {} views, {} results",
        scenario.views.len(),
        scenario.results.len(),
    );
    eprintln!("Optimizer: {optimizer:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match run_once(&cli, &scenario, &filters, optimizer) {
            Ok(outcome) => {
                if cli.json {
                    match serde_json::to_string_pretty(&outcome.report) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing report: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    print_outcome(&outcome);
                }
                all_diagnostics.push(outcome.report.diagnostics);
            }
            Err(msg) => {
                eprintln!("{msg}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&OptimizationDiagnostics) -> std::time::Duration;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[OptimizationDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Node building", |d| d.node_building),
        ("Edge building", |d| d.edge_building),
        ("Solve", |d| d.solve),
        ("Commit", |d| d.commit),
    ];

    for (name, extractor) in stage_extractors {
        let stage_mean = all_diagnostics
            .iter()
            .map(|d| extractor(d).as_secs_f64() * 1000.0)
            .sum::<f64>()
            / all_diagnostics.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
