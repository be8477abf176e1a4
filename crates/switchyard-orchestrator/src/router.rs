use crate::task::AgentTask;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{
    codes, AgentDefinition, ErrorInfo, MetricsSink, NoopMetrics, Severity, SnapshotMap,
    SwitchyardError,
};
use switchyard_registry::{AgentRegistry, LoadMetrics, PerformanceMetrics};
use switchyard_runtime::AgentInstance;
use tracing::{debug, info, warn};

/// How the router picks among suitable agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Blend of suitability and spare capacity.
    #[default]
    Balanced,
    /// Highest performance score.
    Performance,
    /// Highest reliability score.
    Reliability,
    /// Fewest active plus queued tasks.
    LeastConnections,
    /// Rotate through candidates per task type.
    RoundRobin,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoutingStrategy::Balanced => "balanced",
            RoutingStrategy::Performance => "performance",
            RoutingStrategy::Reliability => "reliability",
            RoutingStrategy::LeastConnections => "least_connections",
            RoutingStrategy::RoundRobin => "round_robin",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "balanced" => Ok(RoutingStrategy::Balanced),
            "performance" => Ok(RoutingStrategy::Performance),
            "reliability" => Ok(RoutingStrategy::Reliability),
            "least_connections" | "leastconnections" => Ok(RoutingStrategy::LeastConnections),
            "round_robin" | "roundrobin" => Ok(RoutingStrategy::RoundRobin),
            other => Err(SwitchyardError::Validation(format!(
                "unknown routing strategy '{other}'"
            ))),
        }
    }
}

/// Rolling outcomes of one agent on one task type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    /// Attempts recorded.
    pub attempts: u64,
    /// Successful attempts.
    pub successes: u64,
    /// Failed attempts.
    pub failures: u64,
    /// Running mean duration.
    pub average_duration_ms: f64,
}

impl ExecutionHistory {
    /// Fold in one attempt.
    pub fn record(&self, duration_ms: f64, success: bool) -> Self {
        let attempts = self.attempts + 1;
        #[allow(clippy::cast_precision_loss)]
        let average =
            self.average_duration_ms + (duration_ms - self.average_duration_ms) / attempts as f64;
        Self {
            attempts,
            successes: self.successes + u64::from(success),
            failures: self.failures + u64::from(!success),
            average_duration_ms: average,
        }
    }

    /// Fraction of attempts that succeeded, 0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.successes as f64 / self.attempts as f64;
        rate
    }
}

/// A candidate the router considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingCandidate {
    /// Candidate agent.
    pub agent_id: String,
    /// Its best usable instance, if any.
    pub instance_id: Option<String>,
    /// Suitability, 0..=100.
    pub suitability: f64,
    /// Load score at decision time.
    pub load_score: f64,
    /// The value the strategy ranked by.
    pub score: f64,
}

/// The router's decision record.
#[derive(Debug, Clone)]
pub struct TaskRoutingResult {
    /// Task routed.
    pub task_id: String,
    /// Its type.
    pub task_type: String,
    /// Strategy used.
    pub strategy: RoutingStrategy,
    /// Selected agent.
    pub agent_id: Option<String>,
    /// Selected instance.
    pub instance: Option<Arc<AgentInstance>>,
    /// Suitability of the selected agent.
    pub suitability_score: f64,
    /// Expected duration of the attempt.
    pub predicted_execution_ms: u64,
    /// Why this decision was made.
    pub rationale: Vec<String>,
    /// Other candidates considered.
    pub alternatives: Vec<RoutingCandidate>,
    /// Whether an instance was selected.
    pub success: bool,
    /// Why not, when unsuccessful.
    pub error: Option<ErrorInfo>,
    /// Decision time.
    pub routed_at: DateTime<Utc>,
}

impl TaskRoutingResult {
    fn failure(
        task: &AgentTask,
        strategy: RoutingStrategy,
        code: &str,
        message: String,
        mut rationale: Vec<String>,
        alternatives: Vec<RoutingCandidate>,
    ) -> Self {
        rationale.push(message.clone());
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            strategy,
            agent_id: None,
            instance: None,
            suitability_score: 0.0,
            predicted_execution_ms: 0,
            rationale,
            alternatives,
            success: false,
            error: Some(ErrorInfo::new(code, message, Severity::Warning)),
            routed_at: Utc::now(),
        }
    }

    /// Id of the selected instance.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|i| i.id.as_str())
    }
}

/// Suitability of an agent for a task, clamped to 0..=100.
///
/// +40 for a type match, +20 when available, up to +20 for spare capacity,
/// 0.2 × success rate, 0.1 × performance score, up to +10 for this agent's
/// history on this task type, +5 for priority 8 and above.
pub fn suitability_score(
    matches: bool,
    load: &LoadMetrics,
    performance: &PerformanceMetrics,
    historical_success_rate: f64,
    priority: u8,
) -> f64 {
    let mut score = 0.0;
    if matches {
        score += 40.0;
    }
    if load.available {
        score += 20.0;
    }
    score += 20.0 * (100.0 - load.load_score.clamp(0.0, 100.0)) / 100.0;
    score += 0.2 * performance.success_rate + 0.1 * performance.performance_score;
    score += 10.0 * historical_success_rate.clamp(0.0, 1.0);
    if priority >= 8 {
        score += 5.0;
    }
    score.clamp(0.0, 100.0)
}

/// Balanced ranking: 60% suitability, 40% spare capacity.
pub fn balanced_score(suitability: f64, load_score: f64) -> f64 {
    0.6 * suitability + 0.4 * (100.0 - load_score)
}

struct Evaluated {
    definition: Arc<AgentDefinition>,
    instance: Option<Arc<AgentInstance>>,
    suitability: f64,
    load: LoadMetrics,
    performance: PerformanceMetrics,
}

impl Evaluated {
    fn score(&self, strategy: RoutingStrategy) -> f64 {
        match strategy {
            RoutingStrategy::Balanced => balanced_score(self.suitability, self.load.load_score),
            RoutingStrategy::Performance => self.performance.performance_score,
            RoutingStrategy::Reliability => self.performance.reliability_score,
            RoutingStrategy::LeastConnections => f64::from(self.load.connections()),
            RoutingStrategy::RoundRobin => 0.0,
        }
    }

    fn candidate(&self, strategy: RoutingStrategy) -> RoutingCandidate {
        RoutingCandidate {
            agent_id: self.definition.id.clone(),
            instance_id: self.instance.as_ref().map(|i| i.id.clone()),
            suitability: self.suitability,
            load_score: self.load.load_score,
            score: self.score(strategy),
        }
    }
}

/// Picks an agent instance for each task and learns from the outcomes.
pub struct TaskRouter {
    agents: Arc<AgentRegistry>,
    history: SnapshotMap<(String, String), ExecutionHistory>,
    rotation: Mutex<HashMap<String, usize>>,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskRouter {
    /// Create a router over `agents`.
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self {
            agents,
            history: SnapshotMap::new(),
            rotation: Mutex::new(HashMap::new()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Builder: emit routing counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Route a task under `strategy`.
    pub async fn route_task(&self, task: &AgentTask, strategy: RoutingStrategy) -> TaskRoutingResult {
        self.route(task, strategy, &[], &[]).await
    }

    /// Route after a failed attempt: another instance of the same agent first,
    /// then another agent that handles the task type.
    pub async fn route_alternate(
        &self,
        task: &AgentTask,
        strategy: RoutingStrategy,
        failed_agent: &str,
        failed_instances: &[String],
    ) -> TaskRoutingResult {
        let runtime = self.agents.runtime();
        if let Some(instance) = runtime.best_instance(failed_agent, failed_instances).await {
            if let Some(definition) = self.agents.get(failed_agent) {
                let suitability = self.evaluate_agent_suitability(&definition, task);
                let predicted = self.predict_execution_time(failed_agent, task);
                let rationale = vec![format!(
                    "failover to instance {} of agent '{}'",
                    instance.id, failed_agent
                )];
                return self.selected(
                    task,
                    strategy,
                    failed_agent,
                    instance,
                    suitability,
                    predicted,
                    rationale,
                    Vec::new(),
                );
            }
        }

        let mut result = self
            .route(task, strategy, &[failed_agent.to_string()], failed_instances)
            .await;
        result
            .rationale
            .insert(0, format!("failover away from agent '{failed_agent}'"));
        result
    }

    async fn route(
        &self,
        task: &AgentTask,
        strategy: RoutingStrategy,
        exclude_agents: &[String],
        exclude_instances: &[String],
    ) -> TaskRoutingResult {
        let candidates: Vec<_> = self
            .agents
            .find_agents_for_task_type(&task.task_type)
            .into_iter()
            .filter(|a| !exclude_agents.contains(&a.id))
            .collect();
        if candidates.is_empty() {
            return self.failed(TaskRoutingResult::failure(
                task,
                strategy,
                codes::NO_SUITABLE_AGENTS,
                format!("no agents handle task type '{}'", task.task_type),
                Vec::new(),
                Vec::new(),
            ));
        }

        let runtime = self.agents.runtime();
        let mut evaluated = Vec::with_capacity(candidates.len());
        for definition in candidates {
            let instance = runtime.best_instance(&definition.id, exclude_instances).await;
            let load = self.agents.load_metrics(&definition.id);
            let performance = self.agents.performance_metrics(&definition.id);
            let suitability = self.suitability_with(&definition, task, &load, &performance);
            evaluated.push(Evaluated {
                definition,
                instance,
                suitability,
                load,
                performance,
            });
        }

        let mut rationale = vec![format!(
            "{} candidate agent(s) for task type '{}'",
            evaluated.len(),
            task.task_type
        )];
        let chosen = match strategy {
            RoutingStrategy::RoundRobin => {
                Some(self.next_in_rotation(&task.task_type, evaluated.len()))
            }
            RoutingStrategy::LeastConnections => evaluated
                .iter()
                .enumerate()
                .filter(|(_, e)| e.instance.is_some())
                .min_by_key(|(_, e)| e.load.connections())
                .map(|(i, _)| i),
            _ => evaluated
                .iter()
                .enumerate()
                .filter(|(_, e)| e.instance.is_some())
                // min_by over the reversed order keeps the first of equal maxima
                .min_by(|(_, a), (_, b)| b.score(strategy).total_cmp(&a.score(strategy)))
                .map(|(i, _)| i),
        };

        let Some(index) = chosen else {
            let alternatives = evaluated.iter().map(|e| e.candidate(strategy)).collect();
            return self.failed(TaskRoutingResult::failure(
                task,
                strategy,
                codes::NO_AVAILABLE_INSTANCES,
                format!("no running instance available for task type '{}'", task.task_type),
                rationale,
                alternatives,
            ));
        };

        let chosen = evaluated.swap_remove(index);
        let alternatives: Vec<_> = evaluated.iter().map(|e| e.candidate(strategy)).collect();
        rationale.push(format!(
            "strategy {} selected agent '{}' (score {:.1})",
            strategy,
            chosen.definition.id,
            chosen.score(strategy)
        ));
        let Some(instance) = chosen.instance.clone() else {
            return self.failed(TaskRoutingResult::failure(
                task,
                strategy,
                codes::NO_AVAILABLE_INSTANCES,
                format!("agent '{}' has no available instance", chosen.definition.id),
                rationale,
                alternatives,
            ));
        };
        rationale.push(format!(
            "suitability {:.1}, load {:.1}, instance {}",
            chosen.suitability, chosen.load.load_score, instance.id
        ));

        let predicted = self.predict_execution_time(&chosen.definition.id, task);
        self.selected(
            task,
            strategy,
            &chosen.definition.id,
            instance,
            chosen.suitability,
            predicted,
            rationale,
            alternatives,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn selected(
        &self,
        task: &AgentTask,
        strategy: RoutingStrategy,
        agent_id: &str,
        instance: Arc<AgentInstance>,
        suitability: f64,
        predicted: u64,
        rationale: Vec<String>,
        alternatives: Vec<RoutingCandidate>,
    ) -> TaskRoutingResult {
        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            instance_id = %instance.id,
            %strategy,
            suitability,
            "task routed"
        );
        let strategy_name = strategy.to_string();
        self.metrics.increment(
            "task.routed",
            &[("agent_id", agent_id), ("strategy", strategy_name.as_str())],
        );
        TaskRoutingResult {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            strategy,
            agent_id: Some(agent_id.to_string()),
            instance: Some(instance),
            suitability_score: suitability,
            predicted_execution_ms: predicted,
            rationale,
            alternatives,
            success: true,
            error: None,
            routed_at: Utc::now(),
        }
    }

    fn failed(&self, result: TaskRoutingResult) -> TaskRoutingResult {
        if let Some(error) = &result.error {
            warn!(task_id = %result.task_id, code = %error.code, "routing failed: {}", error.message);
        }
        self.metrics.increment(
            "task.routing.failed",
            &[("task_type", result.task_type.as_str())],
        );
        result
    }

    fn next_in_rotation(&self, task_type: &str, count: usize) -> usize {
        let mut rotation = self.rotation.lock();
        let counter = rotation.entry(task_type.to_lowercase()).or_insert(0);
        let index = *counter % count;
        *counter = (index + 1) % count;
        index
    }

    /// Suitability of `definition` for `task`, 0..=100.
    pub fn evaluate_agent_suitability(&self, definition: &AgentDefinition, task: &AgentTask) -> f64 {
        let load = self.agents.load_metrics(&definition.id);
        let performance = self.agents.performance_metrics(&definition.id);
        self.suitability_with(definition, task, &load, &performance)
    }

    fn suitability_with(
        &self,
        definition: &AgentDefinition,
        task: &AgentTask,
        load: &LoadMetrics,
        performance: &PerformanceMetrics,
    ) -> f64 {
        let matches = definition.handles(&task.task_type)
            || self
                .agents
                .capabilities()
                .capabilities_for_agent(&definition.id)
                .iter()
                .any(|e| e.capability.category.eq_ignore_ascii_case(&task.task_type));
        let history = self.history(&definition.id, &task.task_type);
        suitability_score(
            matches,
            load,
            performance,
            history.success_rate(),
            task.priority,
        )
    }

    /// Expected duration: this agent's history on the task type, else its
    /// overall average, else `max(5s, 10% of the task timeout)`.
    pub fn predict_execution_time(&self, agent_id: &str, task: &AgentTask) -> u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let as_ms = |avg: f64| avg.max(0.0).round() as u64;
        let history = self.history(agent_id, &task.task_type);
        if history.attempts > 0 {
            return as_ms(history.average_duration_ms);
        }
        let ledger = self.agents.ledger(agent_id);
        if ledger.total > 0 {
            return as_ms(ledger.average_duration_ms);
        }
        (task.timeout_ms / 10).max(5_000)
    }

    /// Note that an attempt routed by `routing` is about to be dispatched.
    pub fn record_dispatch(&self, routing: &TaskRoutingResult) {
        if let Some(agent_id) = &routing.agent_id {
            self.agents.begin_execution(agent_id);
        }
    }

    /// Learn from one settled attempt. Call exactly once per dispatched attempt.
    pub fn record_execution_outcome(&self, routing: &TaskRoutingResult, success: bool, duration_ms: f64) {
        let Some(agent_id) = &routing.agent_id else {
            return;
        };
        if self.agents.get(agent_id).is_none() {
            debug!(task_id = %routing.task_id, agent_id = %agent_id, "outcome for unregistered agent dropped");
            return;
        }
        let key = (agent_id.clone(), routing.task_type.to_lowercase());
        let _ = self.history.insert_if_absent(key.clone(), ExecutionHistory::default());
        let _ = self.history.update(&key, |current| {
            Ok::<_, ()>(current.record(duration_ms, success))
        });
        self.agents
            .record_execution_outcome(agent_id, duration_ms, success);
        debug!(
            task_id = %routing.task_id,
            agent_id = %agent_id,
            success,
            duration_ms,
            "routing outcome recorded"
        );
    }

    /// History of `agent_id` on `task_type`.
    pub fn history(&self, agent_id: &str, task_type: &str) -> ExecutionHistory {
        self.history
            .get(&(agent_id.to_string(), task_type.to_lowercase()))
            .map(|h| (*h).clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn load(score: f64) -> LoadMetrics {
        LoadMetrics {
            load_score: score,
            ..LoadMetrics::unmeasured("a")
        }
    }

    #[test]
    fn test_strategy_parse_and_display() {
        assert_eq!("round-robin".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::RoundRobin);
        assert_eq!(
            "Least_Connections".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::LeastConnections
        );
        assert!("fastest".parse::<RoutingStrategy>().is_err());
        assert_eq!(RoutingStrategy::Balanced.to_string(), "balanced");
    }

    #[test]
    fn test_suitability_is_clamped() {
        let perf = PerformanceMetrics::unmeasured("a");
        // 40 + 20 + 20 + 20 + 10 + 10 + 5 exceeds 100
        let score = suitability_score(true, &load(0.0), &perf, 1.0, 9);
        assert_eq!(score, 100.0);

        let cold = PerformanceMetrics {
            success_rate: 0.0,
            performance_score: 0.0,
            ..perf
        };
        let busy = LoadMetrics {
            available: false,
            ..load(100.0)
        };
        assert_eq!(suitability_score(false, &busy, &cold, 0.0, 0), 0.0);
    }

    #[test]
    fn test_suitability_parts() {
        let perf = PerformanceMetrics {
            success_rate: 50.0,
            performance_score: 40.0,
            ..PerformanceMetrics::unmeasured("a")
        };
        // 40 match + 20 available + 10 spare + 10 success + 4 perf + 5 history
        let score = suitability_score(true, &load(50.0), &perf, 0.5, 3);
        assert!((score - 89.0).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_score_is_monotonic_in_load() {
        for suitability in [0.0, 35.5, 80.0, 100.0] {
            let mut previous = f64::INFINITY;
            for load in (0..=100).map(f64::from) {
                let score = balanced_score(suitability, load);
                assert!(score <= previous);
                previous = score;
            }
        }
    }

    #[test]
    fn test_history_success_rate() {
        let history = ExecutionHistory::default();
        assert_eq!(history.success_rate(), 0.0);
        let history = history.record(100.0, true).record(300.0, false);
        assert_eq!(history.success_rate(), 0.5);
        assert_eq!(history.average_duration_ms, 200.0);
    }
}
