use parking_lot::Mutex;
use std::collections::HashMap;

/// Narrow counter/gauge interface to an external metrics sink.
///
/// Calls are infallible from the caller's view: a sink that cannot emit must
/// swallow the failure rather than surface it to the orchestration path.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn increment(&self, name: &str, tags: &[(&str, &str)]);

    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: &[(&str, &str)]) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}

/// Emits every metric as a `tracing` debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        tracing::debug!(target: "switchyard::metrics", metric = name, ?tags, "counter");
    }

    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        tracing::debug!(target: "switchyard::metrics", metric = name, value, ?tags, "gauge");
    }
}

/// Keeps counters and the last gauge values in memory (tags are ignored).
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Last value recorded for a gauge.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    /// Snapshot of all counters.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, _tags: &[(&str, &str)]) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    fn gauge(&self, name: &str, value: f64, _tags: &[(&str, &str)]) {
        self.gauges.lock().insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("task.routed", &[("strategy", "balanced")]);
        metrics.increment("task.routed", &[]);
        assert_eq!(metrics.counter("task.routed"), 2);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_in_memory_gauges_keep_last_value() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge("agent.load_score", 10.0, &[]);
        metrics.gauge("agent.load_score", 42.5, &[]);
        assert_eq!(metrics.gauge_value("agent.load_score"), Some(42.5));
    }

    #[test]
    fn test_noop_and_tracing_do_not_panic() {
        NoopMetrics.increment("x", &[]);
        TracingMetrics.gauge("y", 1.0, &[("k", "v")]);
    }
}
