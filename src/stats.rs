//! # Latency Statistics
//!
//! Summaries derived from the latency samples collected by `EngineState`.
//!
//! ## Snapshot Rule:
//! The samples are copied under the aggregate lock and everything else (sorting,
//! percentiles, formatting) happens on the copy, so producing a report never blocks the
//! sessions that are still recording samples.
//!
//! ## Percentiles:
//! Nearest-rank on the sorted samples: the p-th percentile is `sorted[floor(p × n / 100)]`.

use crate::state::{EngineState, LatencySamples};
use serde::Serialize;
use std::fmt;

/// Summary of one latency sequence, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
}

impl LatencySummary {
    /// `None` for an empty sequence.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let percentile = |p: usize| sorted[(p * n / 100).min(n - 1)];

        Some(Self {
            count: n,
            median: percentile(50),
            p90: percentile(90),
            p95: percentile(95),
            p99: percentile(99),
            avg: sorted.iter().sum::<f64>() / n as f64,
        })
    }
}

/// The three latency rows reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub latencies: Option<LatencySummary>,
    pub intermediate: Option<LatencySummary>,
    pub finals: Option<LatencySummary>,
}

impl StatsReport {
    pub fn from_samples(samples: &LatencySamples) -> Self {
        Self {
            latencies: LatencySummary::from_samples(&samples.all),
            intermediate: LatencySummary::from_samples(&samples.interim),
            finals: LatencySummary::from_samples(&samples.finals),
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Latencies", &self.latencies),
            ("Intermediate latencies", &self.intermediate),
            ("Final latencies", &self.finals),
        ];

        for (name, summary) in rows {
            // Empty sequences are left out
            if let Some(s) = summary {
                writeln!(f, "{} (ms):", name)?;
                writeln!(f, "\t\tMedian\t\t90th\t\t95th\t\t99th\t\tAvg")?;
                writeln!(
                    f,
                    "\t\t{:.5}\t\t{:.5}\t\t{:.5}\t\t{:.5}\t\t{:.5}",
                    s.median, s.p90, s.p95, s.p99, s.avg
                )?;
            }
        }
        Ok(())
    }
}

/// Reads the pool aggregates and produces latency reports on demand.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    state: EngineState,
}

impl StatsReporter {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    /// Summary of every sample recorded so far.
    pub fn report(&self) -> StatsReport {
        let samples = self.state.latency_snapshot();
        StatsReport::from_samples(&samples)
    }

    /// Print the latency report to stdout.
    ///
    /// Without real-time pacing the measured times are dominated by queueing inside the
    /// server, so the report is replaced by a hint.
    pub fn print(&self, simulate_realtime: bool) {
        if simulate_realtime {
            print!("{}", self.report());
        } else {
            println!(
                "Not printing latency statistics because the client is run without real-time \
                 simulation. To get latency statistics, enable engine.simulate_realtime and set \
                 engine.chunk_duration_ms to the server chunk duration."
            );
        }
    }
}
