//! Optimization diagnostics: per-stage timing and graph counts.
//!
//! Carried in the [`OptimizationReport`](crate::OptimizationReport) of
//! every successful [`GlobalOptimizer`](crate::GlobalOptimizer) run. A
//! failed run returns only its error.
//!
//! Timestamps are captured via the `web-time` crate, which uses
//! `performance.now()` on WASM and `std::time::Instant` on native.
//! Durations are serialized as fractional seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use web_time::Instant;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Stage timings and counts of one optimization run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationDiagnostics {
    /// Partitioning views into nodes and resolving node placements.
    #[serde(with = "duration_serde")]
    pub node_building: Duration,
    /// Filtering the registry and turning results into edges.
    #[serde(with = "duration_serde")]
    pub edge_building: Duration,
    /// Solving every component, including pruning rounds.
    #[serde(with = "duration_serde")]
    pub solve: Duration,
    /// Writing corrections to the transform chains.
    #[serde(with = "duration_serde")]
    pub commit: Duration,
    /// Wall-clock duration of the whole run.
    #[serde(with = "duration_serde")]
    pub total: Duration,
    /// Nodes in the selection.
    pub node_count: usize,
    /// Edges used.
    pub edge_count: usize,
    /// Registry entries skipped while building edges.
    pub skipped_count: usize,
    /// Links dropped by pruning.
    pub pruned_count: usize,
    /// Multi-node components solved.
    pub component_count: usize,
}

/// Convert a `Duration` to fractional milliseconds.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl OptimizationDiagnostics {
    /// Human-readable multi-line summary.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Optimization Diagnostics\n{}", "=".repeat(60)));
        lines.push(format!(
            "Nodes: {}  |  Edges: {}  |  Components: {}",
            self.node_count, self.edge_count, self.component_count,
        ));
        lines.push(format!(
            "Skipped links: {}  |  Pruned links: {}",
            self.skipped_count, self.pruned_count,
        ));
        lines.push(format!("Total duration: {:.3}ms", duration_ms(self.total)));
        lines.push(String::new());

        lines.push(format!("{:<24} {:>10} {:>10}", "Stage", "Duration", "% Total"));
        lines.push("-".repeat(46));

        let total_ms = duration_ms(self.total);
        for (name, duration) in [
            ("Node building", self.node_building),
            ("Edge building", self.edge_building),
            ("Solve", self.solve),
            ("Commit", self.commit),
        ] {
            let ms = duration_ms(duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%"));
        }

        lines.join("\n")
    }
}

/// Measures consecutive stages of a run.
#[derive(Debug)]
pub(crate) struct StageTimer {
    start: Instant,
    lap: Instant,
}

impl StageTimer {
    pub(crate) fn start() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            lap: now,
        }
    }

    /// Time since the previous lap (or the start).
    pub(crate) fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.lap);
        self.lap = now;
        elapsed
    }

    /// Time since the start.
    pub(crate) fn total(&self) -> Duration {
        self.start.elapsed()
    }
}
