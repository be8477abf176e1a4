//! End-to-end routing and execution scenarios over simulated agent processes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    codes, AgentDefinition, CapabilityDescriptor, InMemoryMetrics, OrchestrationEvent,
    SwitchyardError, SwitchyardResult,
};
use switchyard_orchestrator::*;
use switchyard_runtime::{
    AgentEndpoint, AgentInstance, Invocation, RuntimeConfig, SimulatedProcessControl,
};

/// Fails with queued messages first, then succeeds. Inputs may also ask for
/// a delay (`delay_ms`), a fixed failure (`fail`), or for the serving process
/// to die mid-call (`crash`).
#[derive(Default)]
struct ScriptedEndpoint {
    failures: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
    processes: Mutex<Option<Arc<SimulatedProcessControl>>>,
}

impl ScriptedEndpoint {
    fn fail_next(&self, messages: &[&str]) {
        self.failures
            .lock()
            .extend(messages.iter().map(|m| m.to_string()));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentEndpoint for ScriptedEndpoint {
    async fn invoke(
        &self,
        instance: &AgentInstance,
        _definition: &AgentDefinition,
        invocation: &Invocation,
    ) -> SwitchyardResult<Value> {
        self.calls.lock().push(instance.id.clone());
        if let Some(ms) = invocation.input.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if invocation.input.get("crash").and_then(Value::as_bool) == Some(true) {
            let processes = self.processes.lock().clone();
            if let (Some(processes), Some(pid)) = (processes, instance.pid) {
                processes.force_exit(pid, Some(139));
            }
            return Err(SwitchyardError::Execution("connection reset by peer".into()));
        }
        if let Some(message) = invocation.input.get("fail").and_then(Value::as_str) {
            return Err(SwitchyardError::Execution(message.to_string()));
        }
        let scripted = self.failures.lock().pop_front();
        match scripted {
            Some(message) => Err(SwitchyardError::Execution(message)),
            None => Ok(json!({ "instance": instance.id, "operation": invocation.operation })),
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
    endpoint: Arc<ScriptedEndpoint>,
    processes: Arc<SimulatedProcessControl>,
    metrics: Arc<InMemoryMetrics>,
}

fn fixture_with(configure: impl FnOnce(&mut SwitchyardConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SwitchyardConfig::default();
    config.runtime = RuntimeConfig::default().with_work_root(dir.path());
    config.executor = ExecutorConfig::default().with_backoff(1, 5);
    configure(&mut config);

    let processes = Arc::new(SimulatedProcessControl::new());
    let endpoint = Arc::new(ScriptedEndpoint::default());
    *endpoint.processes.lock() = Some(processes.clone());
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::builder()
        .config(config)
        .process(processes.clone(), endpoint.clone())
        .metrics(metrics.clone())
        .build();
    Fixture {
        _dir: dir,
        orchestrator,
        endpoint,
        processes,
        metrics,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

async fn deploy_analysts(f: &Fixture) {
    let summarize = CapabilityDescriptor::new("summarize", "Summarize", "summarization");
    f.orchestrator
        .deploy(
            AgentDefinition::new("analyst-a", "Analyst A", "analysis")
                .with_capabilities(["summarize"]),
            vec![summarize],
            1,
        )
        .await
        .unwrap();
    f.orchestrator
        .deploy(AgentDefinition::new("analyst-b", "Analyst B", "analysis"), Vec::new(), 1)
        .await
        .unwrap();
}

async fn wait_for(f: &Fixture, task_id: &str, status: TaskStatus) {
    for _ in 0..200 {
        if f.orchestrator.executor().get_task(task_id).map(|t| t.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status}");
}

#[tokio::test]
async fn test_round_robin_alternates_between_agents() {
    let f = fixture();
    deploy_analysts(&f).await;
    let router = f.orchestrator.router();
    let task = AgentTask::new("report", "analysis", json!({}));

    let picks: Vec<String> = {
        let mut picks = Vec::new();
        for _ in 0..3 {
            let routed = router.route_task(&task, RoutingStrategy::RoundRobin).await;
            assert!(routed.success);
            picks.push(routed.agent_id.unwrap());
        }
        picks
    };
    assert_eq!(picks, ["analyst-a", "analyst-b", "analyst-a"]);
    assert_eq!(f.metrics.counter("task.routed"), 3);
}

#[tokio::test]
async fn test_unknown_task_type_fails_without_retrying() {
    let f = fixture();
    deploy_analysts(&f).await;
    let task = f
        .orchestrator
        .executor()
        .execute_task(AgentTask::new("paint", "painting", json!({})))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().code, codes::NO_SUITABLE_AGENTS);
    assert_eq!(task.result.as_ref().unwrap().attempts, 1);
    assert!(f.endpoint.calls().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let f = fixture();
    f.orchestrator
        .deploy(AgentDefinition::new("worker", "Worker", "analysis"), Vec::new(), 1)
        .await
        .unwrap();
    f.endpoint.fail_next(&["connection timeout", "connection timeout"]);
    let mut events = f.orchestrator.events().subscribe();

    let task = f
        .orchestrator
        .executor()
        .execute_task(AgentTask::new("report", "analysis", json!({})).with_max_retries(3))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.progress, 100);
    let result = task.result.as_ref().unwrap();
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert!(result.logs.iter().any(|l| l.contains("completed after 3 attempt")));
    assert_eq!(f.endpoint.calls().len(), 3);

    let mut retrying = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if let OrchestrationEvent::TaskRetrying { attempt, .. } = envelope.event {
            retrying.push(attempt);
        }
    }
    assert_eq!(retrying, [2, 3]);
    assert_eq!(f.metrics.counter("task.retry"), 2);
    assert_eq!(f.metrics.counter("task.execution.success"), 1);
}

#[tokio::test]
async fn test_permanent_failure_stops_after_one_attempt() {
    let f = fixture();
    deploy_analysts(&f).await;
    let task = f
        .orchestrator
        .executor()
        .execute_task(
            AgentTask::new("report", "analysis", json!({ "fail": "invalid input" }))
                .with_max_retries(0),
        )
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.as_ref().unwrap();
    assert_eq!(error.code, codes::EXECUTION_FAILED);
    assert!(error.message.contains("invalid input"));
    assert_eq!(task.result.as_ref().unwrap().attempts, 1);
    assert_eq!(f.endpoint.calls().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_are_reported() {
    let f = fixture();
    deploy_analysts(&f).await;
    let task = f
        .orchestrator
        .executor()
        .execute_task(
            AgentTask::new("report", "analysis", json!({ "fail": "service overloaded" }))
                .with_max_retries(1),
        )
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.as_ref().unwrap();
    assert_eq!(error.code, codes::RETRIES_EXHAUSTED);
    assert!(error.message.contains("service overloaded"));
    assert_eq!(task.result.as_ref().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_unhealthy_target_is_reported_as_such() {
    let f = fixture();
    f.orchestrator
        .deploy(AgentDefinition::new("indexer", "Indexer", "indexing"), Vec::new(), 1)
        .await
        .unwrap();

    // The only instance dies during the first attempt; the retry finds no
    // alternate and lands on the dead instance.
    let task = f
        .orchestrator
        .executor()
        .execute_task(
            AgentTask::new("reindex", "indexing", json!({ "crash": true })).with_max_retries(1),
        )
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.as_ref().unwrap();
    assert_eq!(error.code, codes::AGENT_UNHEALTHY);
    assert!(error.message.contains("2 attempt(s) failed"));
    assert!(error.message.contains("unavailable"));
    assert_eq!(task.result.as_ref().unwrap().attempts, 2);
    // The health check stopped the second attempt before dispatch.
    assert_eq!(f.endpoint.calls().len(), 1);
    assert_eq!(f.processes.alive_count(), 0);
}

#[tokio::test]
async fn test_retry_fails_over_to_another_instance() {
    let f = fixture();
    f.orchestrator
        .deploy(AgentDefinition::new("worker", "Worker", "analysis"), Vec::new(), 2)
        .await
        .unwrap();
    f.endpoint.fail_next(&["network unreachable"]);

    let task = f
        .orchestrator
        .executor()
        .execute_task(AgentTask::new("report", "analysis", json!({})))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    let calls = f.endpoint.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
    assert_eq!(task.result.as_ref().unwrap().instance_id.as_deref(), Some(calls[1].as_str()));
}

#[tokio::test]
async fn test_cancelling_during_backoff_ends_cancelled() {
    let f = fixture_with(|config| {
        config.executor = ExecutorConfig::default().with_backoff(5_000, 5_000);
    });
    deploy_analysts(&f).await;
    f.endpoint.fail_next(&["connection timeout"]);

    let executor = f.orchestrator.executor().clone();
    let task = AgentTask::new("report", "analysis", json!({}));
    let id = task.id.clone();
    let run = tokio::spawn(async move { executor.execute_task(task).await });

    wait_for(&f, &id, TaskStatus::Retrying).await;
    let cancelled = f.orchestrator.executor().cancel_task(&id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let finished = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("execution should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Cancelled);
    assert_eq!(finished.error.as_ref().unwrap().code, codes::CANCELLED);
    assert_eq!(f.endpoint.calls().len(), 1);
    assert_eq!(f.metrics.counter("task.cancelled"), 1);

    // Terminal tasks cannot be cancelled twice, but can be retried.
    assert!(f.orchestrator.executor().cancel_task(&id).is_err());
    let requeued = f.orchestrator.executor().retry_task(&id).unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.error.is_none());
}

#[tokio::test]
async fn test_paused_task_waits_for_resume() {
    let f = fixture();
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor().clone();
    let task = AgentTask::new("report", "analysis", json!({ "delay_ms": 100 }));
    let id = task.id.clone();
    let run = tokio::spawn(async move { executor.execute_task(task).await });

    wait_for(&f, &id, TaskStatus::Running).await;
    let progressed = f
        .orchestrator
        .executor()
        .update_progress(&id, 150, Some("halfway".into()))
        .unwrap();
    assert_eq!(progressed.progress, 100);
    f.orchestrator.executor().pause_task(&id).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        f.orchestrator.executor().get_task(&id).unwrap().status,
        TaskStatus::Paused
    );
    assert!(!run.is_finished());

    f.orchestrator.executor().resume_task(&id).unwrap();
    let finished = run.await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_batch_reports_aggregate_status() {
    let f = fixture();
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor();

    let ok = executor
        .execute_batch(
            vec![
                AgentTask::new("one", "analysis", json!({})),
                AgentTask::new("two", "analysis", json!({})),
            ],
            true,
            false,
        )
        .await
        .unwrap();
    assert_eq!(ok.status, TaskStatus::Completed);
    assert!(ok.errors.is_empty());

    let mixed = executor
        .execute_batch(
            vec![
                AgentTask::new("bad", "analysis", json!({ "fail": "invalid input" }))
                    .with_max_retries(0),
                AgentTask::new("good", "analysis", json!({})),
            ],
            false,
            false,
        )
        .await
        .unwrap();
    assert_eq!(mixed.status, TaskStatus::Failed);
    assert_eq!(mixed.errors.len(), 1);
    assert_eq!(mixed.tasks[1].status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_fail_fast_batch_cancels_the_rest() {
    let f = fixture();
    deploy_analysts(&f).await;
    let outcome = f
        .orchestrator
        .executor()
        .execute_batch(
            vec![
                AgentTask::new("bad", "analysis", json!({ "fail": "invalid input" }))
                    .with_max_retries(0),
                AgentTask::new("later", "analysis", json!({})),
            ],
            false,
            true,
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.tasks[0].status, TaskStatus::Failed);
    assert_eq!(outcome.tasks[1].status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_invalid_batch_is_rejected_before_anything_is_stored() {
    let f = fixture();
    let executor = f.orchestrator.executor();
    let err = executor
        .execute_batch(
            vec![
                AgentTask::new("fine", "analysis", json!({})),
                AgentTask::new("", "analysis", json!({})),
            ],
            true,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::Validation(_)));
    assert_eq!(executor.summary().total, 0);
}

#[tokio::test]
async fn test_scheduler_respects_dependencies() {
    let f = fixture();
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor();

    let first = executor
        .queue_task(AgentTask::new("first", "analysis", json!({})).with_priority(1))
        .unwrap();
    let second = executor
        .queue_task(
            AgentTask::new("second", "analysis", json!({}))
                .with_priority(9)
                .with_dependencies([first.id.clone()]),
        )
        .unwrap();

    let report = executor.scheduler_pass();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred, 1);
    wait_for(&f, &first.id, TaskStatus::Completed).await;

    let report = executor.scheduler_pass();
    assert_eq!(report.dispatched, 1);
    wait_for(&f, &second.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn test_failed_dependency_fails_the_dependent() {
    let f = fixture();
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor();

    let upstream = executor
        .queue_task(
            AgentTask::new("upstream", "analysis", json!({ "fail": "invalid input" }))
                .with_max_retries(0),
        )
        .unwrap();
    let downstream = executor
        .queue_task(
            AgentTask::new("downstream", "analysis", json!({}))
                .with_dependencies([upstream.id.clone()]),
        )
        .unwrap();

    executor.scheduler_pass();
    wait_for(&f, &upstream.id, TaskStatus::Failed).await;
    let report = executor.scheduler_pass();
    assert_eq!(report.dependency_failures, 1);

    let downstream = executor.get_task(&downstream.id).unwrap();
    assert_eq!(downstream.status, TaskStatus::Failed);
    assert_eq!(downstream.error.as_ref().unwrap().code, codes::DEPENDENCY_FAILED);
}

#[tokio::test]
async fn test_dependency_cycles_are_rejected() {
    let f = fixture();
    let executor = f.orchestrator.executor();
    executor
        .queue_task(AgentTask::new("a", "analysis", json!({})).with_id("a").with_dependencies(["b"]))
        .unwrap();
    let err = executor
        .queue_task(AgentTask::new("b", "analysis", json!({})).with_id("b").with_dependencies(["a"]))
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::Validation(_)));
    assert!(executor.get_task("b").is_none());
}

#[tokio::test]
async fn test_future_tasks_stay_queued() {
    let f = fixture();
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor();
    let later = executor
        .queue_task(
            AgentTask::new("later", "analysis", json!({}))
                .scheduled_for(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .unwrap();

    let report = executor.scheduler_pass();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(executor.get_task(&later.id).unwrap().status, TaskStatus::Queued);
    assert_eq!(executor.store().queue_len(), 1);
}

#[tokio::test]
async fn test_cleanup_purges_expired_terminal_tasks() {
    let f = fixture_with(|config| config.executor.retention_secs = 0);
    deploy_analysts(&f).await;
    let executor = f.orchestrator.executor();
    let done = executor
        .execute_task(AgentTask::new("done", "analysis", json!({})))
        .await
        .unwrap();
    let waiting = executor
        .queue_task(
            AgentTask::new("waiting", "analysis", json!({}))
                .scheduled_for(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(executor.cleanup_once(), 1);
    assert!(executor.get_task(&done.id).is_none());
    assert!(executor.get_task(&waiting.id).is_some());
    assert_eq!(f.metrics.counter("task.purged"), 1);
}

#[tokio::test]
async fn test_execution_outcomes_feed_routing_history() {
    let f = fixture();
    f.orchestrator
        .deploy(AgentDefinition::new("worker", "Worker", "analysis"), Vec::new(), 1)
        .await
        .unwrap();
    f.orchestrator
        .executor()
        .execute_task(AgentTask::new("report", "analysis", json!({})))
        .await
        .unwrap();

    let history = f.orchestrator.router().history("worker", "analysis");
    assert_eq!(history.attempts, 1);
    assert_eq!(history.successes, 1);
    let ledger = f.orchestrator.agents().ledger("worker");
    assert_eq!(ledger.in_flight, 0);
}

#[tokio::test]
async fn test_outcome_after_unregister_is_not_recorded() {
    let f = fixture();
    f.orchestrator
        .deploy(AgentDefinition::new("worker", "Worker", "analysis"), Vec::new(), 1)
        .await
        .unwrap();
    let task = AgentTask::new("report", "analysis", json!({}));
    let routing = f
        .orchestrator
        .router()
        .route_task(&task, RoutingStrategy::Balanced)
        .await;
    assert!(routing.success);

    f.orchestrator.router().record_dispatch(&routing);
    assert!(f.orchestrator.agents().unregister("worker").unwrap());
    f.orchestrator
        .router()
        .record_execution_outcome(&routing, true, 12.0);

    assert_eq!(f.orchestrator.router().history("worker", "analysis").attempts, 0);
    assert_eq!(f.orchestrator.agents().ledger("worker").total, 0);
}

#[tokio::test]
async fn test_shutdown_stops_loops_and_instances() {
    let f = fixture();
    deploy_analysts(&f).await;
    f.orchestrator.start();
    f.orchestrator.start();
    f.orchestrator.shutdown().await;
    assert!(f
        .orchestrator
        .runtime()
        .list_instances()
        .iter()
        .all(|i| !i.is_running()));
}
