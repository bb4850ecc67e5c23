// Launch metrics module
//
// Per-invocation step timings for a single launch attempt

use indexmap::IndexMap;
use std::time::{Duration, Instant};

/// Step timings for one launch attempt
///
/// Created by the orchestrator at the start of an invocation and dropped with it.
/// Nothing here is shared between launches, so concurrent launches keep separate
/// timings. Steps are kept in the order they were first recorded.
#[derive(Debug, Clone)]
pub struct LaunchMetrics {
    /// Duration per pipeline step
    steps: IndexMap<&'static str, Duration>,

    /// Invocation start time
    start_time: Instant,
}

impl LaunchMetrics {
    /// Create a new LaunchMetrics instance
    pub fn new() -> Self {
        Self {
            steps: IndexMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Record the duration of a step. Recording the same step again adds to it.
    pub fn record(&mut self, step: &'static str, duration: Duration) {
        *self.steps.entry(step).or_default() += duration;
    }

    /// Record the time elapsed since `started`
    pub fn record_since(&mut self, step: &'static str, started: Instant) {
        self.record(step, started.elapsed());
    }

    /// Get the recorded duration of a step
    pub fn step(&self, step: &str) -> Option<Duration> {
        self.steps.get(step).copied()
    }

    /// Get total elapsed time since the invocation started
    pub fn total(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Summary lines, one per step plus the total, in recording order
    pub fn summary_lines(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|(step, duration)| format!("Performance: {} {:.2?}", step, duration))
            .chain(std::iter::once(format!(
                "Performance: total {:.2?}",
                self.total()
            )))
            .collect()
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Launch Performance ===");
        for (step, duration) in &self.steps {
            tracing::info!("{}: {:.2?}", step, duration);
        }
        tracing::info!("Total: {:.2?}", self.total());
    }
}

impl Default for LaunchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = LaunchMetrics::new();
        assert_eq!(metrics.step("authentication"), None);
        assert_eq!(metrics.summary_lines().len(), 1);
    }

    #[test]
    fn test_record_steps_in_order() {
        let mut metrics = LaunchMetrics::new();

        metrics.record("integrity", Duration::from_millis(5));
        metrics.record("authentication", Duration::from_millis(100));
        metrics.record("integrity", Duration::from_millis(5));

        assert_eq!(metrics.step("integrity"), Some(Duration::from_millis(10)));

        let lines = metrics.summary_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Performance: integrity"));
        assert!(lines[1].starts_with("Performance: authentication"));
        assert!(lines[2].starts_with("Performance: total"));
    }

    #[test]
    fn test_total() {
        let metrics = LaunchMetrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.total().as_millis() >= 10);
    }

    #[test]
    fn test_record_since() {
        let mut metrics = LaunchMetrics::new();
        let started = Instant::now();
        thread::sleep(Duration::from_millis(5));
        metrics.record_since("spawn", started);
        assert!(metrics.step("spawn").unwrap() >= Duration::from_millis(5));
    }
}
