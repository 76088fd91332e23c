use metrics::{Counter, Histogram};

use crate::compare::ComparisonResult;

/// Counter handles for the engine. Embedders that install a metrics
/// recorder see real series; without one these are no-ops.
pub struct Metrics {
    pub comparisons_run: Counter,
    pub matches: Counter,
    pub diffs: Counter,
    pub missing_baselines: Counter,
    pub comparison_errors: Counter,
    pub captures_failed: Counter,
    pub engine_failures: Counter,
    pub compare_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            comparisons_run: Counter::noop(),
            matches: Counter::noop(),
            diffs: Counter::noop(),
            missing_baselines: Counter::noop(),
            comparison_errors: Counter::noop(),
            captures_failed: Counter::noop(),
            engine_failures: Counter::noop(),
            compare_duration: Histogram::noop(),
        }
    }

    pub fn record_comparison(&self, result: &ComparisonResult) {
        self.comparisons_run.increment(1);
        match result {
            ComparisonResult::Match { .. } => self.matches.increment(1),
            ComparisonResult::Diff { engine_results, .. } => {
                self.diffs.increment(1);
                let failures = engine_results.iter().filter(|r| !r.is_ok()).count();
                if failures > 0 {
                    self.engine_failures.increment(failures as u64);
                }
            }
            ComparisonResult::NoBaseline { .. } | ComparisonResult::NoTest { .. } => {
                self.missing_baselines.increment(1);
            }
            ComparisonResult::Error { .. } => self.comparison_errors.increment(1),
        }
    }

    pub fn record_capture_failure(&self) {
        self.captures_failed.increment(1);
    }

    pub fn record_compare_duration(&self, seconds: f64) {
        self.compare_duration.record(seconds);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
