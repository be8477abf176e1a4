use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-agent load aggregate, recomputed by the metrics refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    /// Agent id.
    pub agent_id: String,
    /// 0 (idle) to 100 (saturated).
    pub load_score: f64,
    /// Invocations currently running on the agent's instances.
    pub active_tasks: u32,
    /// Attempts dispatched to the agent but not yet running on an instance.
    pub queued_tasks: u32,
    /// Mean execution duration.
    pub average_response_ms: f64,
    /// Whether any instance can take work.
    pub available: bool,
    /// Running instances counted.
    pub live_instances: usize,
    /// When this snapshot was computed.
    pub updated_at: DateTime<Utc>,
}

impl LoadMetrics {
    /// Neutral metrics for an agent that has not been measured yet.
    pub fn unmeasured(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            load_score: 0.0,
            active_tasks: 0,
            queued_tasks: 0,
            average_response_ms: 0.0,
            available: true,
            live_instances: 0,
            updated_at: Utc::now(),
        }
    }

    /// `active_tasks + queued_tasks`.
    pub fn connections(&self) -> u32 {
        self.active_tasks.saturating_add(self.queued_tasks)
    }
}

/// Per-agent performance aggregate, recomputed by the metrics refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Agent id.
    pub agent_id: String,
    /// Percent of recorded executions that succeeded (100 with no history).
    pub success_rate: f64,
    /// Success blended with instance health, 0..=100.
    pub reliability_score: f64,
    /// Success blended with speed relative to the agent's timeout, 0..=100.
    pub performance_score: f64,
    /// Executions recorded.
    pub total_executions: u64,
    /// When this snapshot was computed.
    pub updated_at: DateTime<Utc>,
}

impl PerformanceMetrics {
    /// Neutral metrics for an agent with no history.
    pub fn unmeasured(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            success_rate: 100.0,
            reliability_score: 100.0,
            performance_score: 100.0,
            total_executions: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Execution outcomes recorded against an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLedger {
    /// Completed attempts.
    pub total: u64,
    /// Successful attempts.
    pub successes: u64,
    /// Failed attempts.
    pub failures: u64,
    /// Running mean duration.
    pub average_duration_ms: f64,
    /// Attempts dispatched and not yet settled.
    pub in_flight: u32,
}

impl ExecutionLedger {
    /// Fold one settled attempt into the ledger.
    pub fn record(&self, duration_ms: f64, success: bool) -> Self {
        let total = self.total + 1;
        #[allow(clippy::cast_precision_loss)]
        let average = self.average_duration_ms + (duration_ms - self.average_duration_ms) / total as f64;
        Self {
            total,
            successes: self.successes + u64::from(success),
            failures: self.failures + u64::from(!success),
            average_duration_ms: average,
            in_flight: self.in_flight,
        }
    }

    /// Percent successful; 100 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.successes as f64 / self.total as f64 * 100.0;
        rate
    }
}

/// Load contributed by one instance: half its CPU plus 25 per running invocation.
pub fn instance_load(cpu_percent: f64, active_invocations: u32) -> f64 {
    (0.5 * cpu_percent + 25.0 * f64::from(active_invocations)).clamp(0.0, 100.0)
}

/// Reliability: 70% success rate, 30% share of healthy instances.
pub fn reliability_score(success_rate: f64, healthy_ratio: f64) -> f64 {
    (0.7 * success_rate + 0.3 * healthy_ratio * 100.0).clamp(0.0, 100.0)
}

/// Performance: half success rate, half speed relative to the timeout budget.
pub fn performance_score(success_rate: f64, average_ms: f64, timeout_ms: f64) -> f64 {
    let speed = if average_ms <= 0.0 || timeout_ms <= 0.0 {
        100.0
    } else {
        (100.0 * (1.0 - average_ms / timeout_ms)).clamp(0.0, 100.0)
    };
    (0.5 * success_rate + 0.5 * speed).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_load_clamps() {
        assert_eq!(instance_load(0.0, 0), 0.0);
        assert_eq!(instance_load(40.0, 1), 45.0);
        assert_eq!(instance_load(100.0, 4), 100.0);
    }

    #[test]
    fn test_ledger_success_rate() {
        let ledger = ExecutionLedger::default();
        assert_eq!(ledger.success_rate(), 100.0);
        let ledger = ledger.record(10.0, true).record(30.0, false);
        assert_eq!(ledger.success_rate(), 50.0);
        assert_eq!(ledger.average_duration_ms, 20.0);
    }

    #[test]
    fn test_reliability_blend() {
        assert_eq!(reliability_score(100.0, 1.0), 100.0);
        assert!((reliability_score(50.0, 0.5) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_rewards_speed() {
        let fast = performance_score(100.0, 100.0, 10_000.0);
        let slow = performance_score(100.0, 9_000.0, 10_000.0);
        assert!(fast > slow);
        assert_eq!(performance_score(100.0, 0.0, 10_000.0), 100.0);
        assert_eq!(performance_score(0.0, 20_000.0, 10_000.0), 0.0);
    }
}
