use crate::config::ExecutorConfig;
use crate::retry::{is_retryable, BackoffPolicy};
use crate::router::{RoutingStrategy, TaskRouter, TaskRoutingResult};
use crate::store::TaskStore;
use crate::task::{AgentTask, TaskResult, TaskStatus, TaskSummary};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{
    codes, run_periodic, ErrorInfo, EventBus, MetricsSink, NoopMetrics, OrchestrationEvent,
    Severity, SwitchyardError, SwitchyardResult,
};
use switchyard_registry::{AgentRegistry, CapabilityRequest};
use switchyard_runtime::Invocation;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-execution signals: cancellation, and wake-up on resume.
#[derive(Debug)]
struct TaskControl {
    cancel: CancellationToken,
    resumed: Notify,
}

struct AttemptFailure {
    code: &'static str,
    error: SwitchyardError,
}

enum Dependencies {
    Ready,
    Waiting,
    Failed { dependency: String, status: TaskStatus },
}

/// Result of [`TaskExecutor::execute_batch`].
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// `Completed` only if every task completed, else `Failed` if any failed,
    /// else `Cancelled` if any was cancelled, else `Running`.
    pub status: TaskStatus,
    /// Final snapshots, in submission order.
    pub tasks: Vec<Arc<AgentTask>>,
    /// Every failure encountered.
    pub errors: Vec<ErrorInfo>,
}

/// What one scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Tasks handed to execution.
    pub dispatched: usize,
    /// Tasks put back on the queue.
    pub deferred: usize,
    /// Tasks failed because a dependency did not complete.
    pub dependency_failures: usize,
}

/// Owns task state and drives execution through the router and runtime.
///
/// Only the executor changes task status. Each execution runs a bounded
/// attempt loop (health check, dispatch, classify, back off, fail over) and
/// leaves the task `Completed`, `Failed` or `Cancelled`.
pub struct TaskExecutor {
    config: ExecutorConfig,
    store: TaskStore,
    router: Arc<TaskRouter>,
    agents: Arc<AgentRegistry>,
    backoff: BackoffPolicy,
    controls: Mutex<HashMap<String, Arc<TaskControl>>>,
    root: CancellationToken,
    batch_slots: Arc<Semaphore>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskExecutor {
    /// Create an executor.
    pub fn new(config: ExecutorConfig, router: Arc<TaskRouter>, agents: Arc<AgentRegistry>) -> Self {
        Self {
            backoff: config.backoff(),
            batch_slots: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            config,
            store: TaskStore::new(),
            router,
            agents,
            controls: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            events: EventBus::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Builder: publish task events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Builder: emit task counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builder: cancel every running execution when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.root = token;
        self
    }

    /// The task store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // --- submission ------------------------------------------------------

    fn check_new(&self, task: &AgentTask) -> SwitchyardResult<()> {
        task.validate()?;
        if task.status != TaskStatus::Pending {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' must be submitted as pending, not {}",
                task.id, task.status
            )));
        }
        if self.store.get(&task.id).is_some() {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' already exists",
                task.id
            )));
        }
        if self.store.has_cycle(task) {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' would create a dependency cycle",
                task.id
            )));
        }
        Ok(())
    }

    /// Validate a task and put it on the scheduler queue.
    pub fn queue_task(&self, mut task: AgentTask) -> SwitchyardResult<Arc<AgentTask>> {
        self.check_new(&task)?;
        task.status = TaskStatus::Queued;
        task.queued_at = Some(Utc::now());
        let stored = self.store.insert(task)?;
        self.store.enqueue(&stored.id, stored.priority);

        info!(task_id = %stored.id, task_type = %stored.task_type, priority = stored.priority, "task queued");
        self.metrics
            .increment("task.queued", &[("task_type", stored.task_type.as_str())]);
        self.events.publish(OrchestrationEvent::TaskQueued {
            task_id: stored.id.clone(),
        });
        Ok(stored)
    }

    /// Run a task now under the default strategy, adding it first if it is new.
    pub async fn execute_task(&self, task: AgentTask) -> SwitchyardResult<Arc<AgentTask>> {
        let id = task.id.clone();
        if self.store.get(&id).is_none() {
            self.check_new(&task)?;
            self.store.insert(task)?;
        }
        self.execute(&id).await
    }

    /// Run a stored `Pending` or `Queued` task under the default strategy.
    pub async fn execute(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        self.execute_with_strategy(task_id, self.config.default_strategy)
            .await
    }

    /// Run a stored `Pending` or `Queued` task to a terminal status.
    ///
    /// Errors are returned only when the task cannot start (unknown id or
    /// illegal state); execution failures end up on the returned task.
    pub async fn execute_with_strategy(
        &self,
        task_id: &str,
        strategy: RoutingStrategy,
    ) -> SwitchyardResult<Arc<AgentTask>> {
        let (control, created) = self.control_for(task_id);
        let started = match self.store.transition(task_id, TaskStatus::Running, |t| {
            t.started_at = Some(Utc::now());
            t.completed_at = None;
            t.result = None;
            t.error = None;
        }) {
            Ok(started) => started,
            Err(e) => {
                if created {
                    self.controls.lock().remove(task_id);
                }
                return Err(e);
            }
        };
        let task = started.current;

        info!(task_id = %task.id, task_type = %task.task_type, %strategy, "task started");
        self.events.publish(OrchestrationEvent::TaskStarted {
            task_id: task.id.clone(),
        });

        let finished = self.run_attempts(&task, strategy, &control).await;
        self.controls.lock().remove(task_id);
        Ok(finished)
    }

    // --- attempt loop ----------------------------------------------------

    async fn run_attempts(
        &self,
        task: &AgentTask,
        strategy: RoutingStrategy,
        control: &TaskControl,
    ) -> Arc<AgentTask> {
        let started = Instant::now();
        let max_attempts = task.max_attempts();
        let mut logs = Vec::new();
        let mut failed_instances: Vec<String> = Vec::new();
        let mut previous: Option<TaskRoutingResult> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if !self.wait_while_paused(&task.id, control).await {
                logs.push(format!("cancelled before attempt {attempt}"));
                return self.finish_cancelled(task, attempt - 1, logs, started);
            }

            let routing = match &previous {
                None => self.router.route_task(task, strategy).await,
                Some(failed) => {
                    let failed_agent = failed.agent_id.clone().unwrap_or_default();
                    let alternate = self
                        .router
                        .route_alternate(task, strategy, &failed_agent, &failed_instances)
                        .await;
                    if alternate.success {
                        alternate
                    } else {
                        debug!(task_id = %task.id, "no alternate target, reusing failed instance");
                        failed.clone()
                    }
                }
            };
            let (Some(agent_id), Some(instance_id)) =
                (routing.agent_id.clone(), routing.instance_id().map(str::to_string))
            else {
                let error = routing.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::ROUTING_FAILED, "routing produced no target", Severity::Error)
                });
                logs.push(format!(
                    "attempt {attempt}/{max_attempts}: routing failed: {}",
                    error.message
                ));
                return self
                    .finish_failed(task, error, attempt, logs, started, None, control)
                    .await;
            };

            let _ = self.store.update(&task.id, |t| {
                if t.status.is_terminal() {
                    return Err(SwitchyardError::InvalidTransition(t.status.to_string()));
                }
                let mut next = t.clone();
                next.agent_id = Some(agent_id.clone());
                next.instance_id = Some(instance_id.clone());
                Ok(next)
            });
            logs.push(format!(
                "attempt {attempt}/{max_attempts}: dispatching to agent '{agent_id}' instance {instance_id}"
            ));

            self.router.record_dispatch(&routing);
            let attempt_started = Instant::now();
            let outcome = self.attempt(task, &routing, &control.cancel).await;
            let elapsed_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;
            self.router
                .record_execution_outcome(&routing, outcome.is_ok(), elapsed_ms);

            let failure = match outcome {
                Ok(output) => {
                    logs.push(format!(
                        "attempt {attempt}/{max_attempts} succeeded in {elapsed_ms:.0}ms"
                    ));
                    return self
                        .finish_completed(task, output, attempt, logs, started, &routing, control)
                        .await;
                }
                Err(failure) => failure,
            };

            if matches!(failure.error, SwitchyardError::Cancelled(_)) {
                logs.push(format!("attempt {attempt}/{max_attempts} cancelled"));
                return self.finish_cancelled(task, attempt, logs, started);
            }
            logs.push(format!(
                "attempt {attempt}/{max_attempts} failed: {}",
                failure.error
            ));
            warn!(
                task_id = %task.id,
                agent_id = %agent_id,
                instance_id = %instance_id,
                attempt,
                error = %failure.error,
                "task attempt failed"
            );

            if !is_retryable(&failure.error) {
                let error = failure.error.to_info_with_code(failure.code);
                return self
                    .finish_failed(task, error, attempt, logs, started, Some(&routing), control)
                    .await;
            }
            if attempt >= max_attempts {
                // An unreachable target keeps its own code.
                let code = if failure.code == codes::AGENT_UNHEALTHY {
                    codes::AGENT_UNHEALTHY
                } else {
                    codes::RETRIES_EXHAUSTED
                };
                let error = ErrorInfo::new(
                    code,
                    format!("{attempt} attempt(s) failed; last error: {}", failure.error),
                    Severity::Error,
                );
                return self
                    .finish_failed(task, error, attempt, logs, started, Some(&routing), control)
                    .await;
            }

            // Back off, then fail over.
            failed_instances.push(instance_id);
            if !self.wait_while_paused(&task.id, control).await
                || self
                    .store
                    .transition(&task.id, TaskStatus::Retrying, |t| t.retry_count = attempt)
                    .is_err()
            {
                return self.finish_cancelled(task, attempt, logs, started);
            }
            self.metrics
                .increment("task.retry", &[("task_type", task.task_type.as_str())]);
            self.events.publish(OrchestrationEvent::TaskRetrying {
                task_id: task.id.clone(),
                attempt: attempt + 1,
            });

            let delay = self.backoff.delay(attempt - 1);
            logs.push(format!("retrying in {}ms", delay.as_millis()));
            tokio::select! {
                _ = control.cancel.cancelled() => {
                    logs.push("cancelled during backoff".to_string());
                    return self.finish_cancelled(task, attempt, logs, started);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if self
                .store
                .transition(&task.id, TaskStatus::Running, |_| {})
                .is_err()
            {
                return self.finish_cancelled(task, attempt, logs, started);
            }
            previous = Some(routing);
        }
    }

    async fn attempt(
        &self,
        task: &AgentTask,
        routing: &TaskRoutingResult,
        cancel: &CancellationToken,
    ) -> Result<Value, AttemptFailure> {
        let (Some(agent_id), Some(instance)) = (&routing.agent_id, &routing.instance) else {
            return Err(AttemptFailure {
                code: codes::NO_AVAILABLE_INSTANCES,
                error: SwitchyardError::Routing("no target selected".into()),
            });
        };
        let runtime = self.agents.runtime();
        let health = runtime.check_instance_health(&instance.id).await;
        if !health.is_usable() {
            return Err(AttemptFailure {
                code: codes::AGENT_UNHEALTHY,
                error: SwitchyardError::Execution(format!(
                    "instance {} of agent '{}' unavailable: health {}",
                    instance.id, agent_id, health
                )),
            });
        }

        let timeout = Duration::from_millis(task.timeout_ms);
        let capabilities = self.agents.capabilities();
        let dispatch = async {
            match capabilities.match_for_task(agent_id, &task.task_type) {
                Some(entry) => {
                    debug!(task_id = %task.id, capability_id = %entry.capability.id, "dispatching through capability");
                    capabilities
                        .execute(
                            CapabilityRequest::new(entry.capability.id.clone(), task.input.clone())
                                .on_agent(agent_id.clone())
                                .on_instance(instance.id.clone())
                                .with_timeout(timeout)
                                .with_config(task.config.clone()),
                        )
                        .await
                        .map(|response| response.output)
                }
                None => {
                    let invocation =
                        Invocation::task(task.task_type.clone(), task.input.clone(), timeout)
                            .with_config(task.config.clone());
                    runtime.invoke(&instance.id, invocation).await
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptFailure {
                code: codes::CANCELLED,
                error: SwitchyardError::Cancelled(format!("task {} cancelled", task.id)),
            }),
            result = dispatch => result.map_err(|error| AttemptFailure { code: error.code(), error }),
        }
    }

    /// Block while the task is paused. Returns `false` if cancelled meanwhile.
    async fn wait_while_paused(&self, task_id: &str, control: &TaskControl) -> bool {
        loop {
            if control.cancel.is_cancelled() {
                return false;
            }
            let notified = control.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.store.get(task_id) {
                Some(task) if task.status == TaskStatus::Paused => {}
                Some(task) if task.status == TaskStatus::Cancelled => return false,
                _ => return true,
            }
            tokio::select! {
                _ = control.cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Apply a terminal transition, waiting out a pause that raced with the attempt.
    async fn settle<F>(
        &self,
        task_id: &str,
        to: TaskStatus,
        control: &TaskControl,
        mutate: F,
    ) -> Option<Arc<AgentTask>>
    where
        F: Fn(&mut AgentTask),
    {
        loop {
            if !self.wait_while_paused(task_id, control).await {
                return None;
            }
            match self.store.transition(task_id, to, &mutate) {
                Ok(swapped) => return Some(swapped.current),
                Err(_) => match self.store.get(task_id) {
                    Some(t) if t.status == TaskStatus::Paused => continue,
                    _ => return None,
                },
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_completed(
        &self,
        task: &AgentTask,
        output: Value,
        attempts: u32,
        mut logs: Vec<String>,
        started: Instant,
        routing: &TaskRoutingResult,
        control: &TaskControl,
    ) -> Arc<AgentTask> {
        logs.push(format!("completed after {attempts} attempt(s)"));
        let result = TaskResult {
            success: true,
            output: Some(output),
            attempts,
            duration_ms: elapsed_ms(started),
            agent_id: routing.agent_id.clone(),
            instance_id: routing.instance_id().map(str::to_string),
            logs,
        };
        let now = Utc::now();
        let settled = self
            .settle(&task.id, TaskStatus::Completed, control, |t| {
                t.result = Some(result.clone());
                t.progress = 100;
                t.completed_at = Some(now);
            })
            .await;
        match settled {
            Some(done) => {
                info!(task_id = %task.id, attempts, duration_ms = result.duration_ms, "task completed");
                self.metrics.increment(
                    "task.execution.success",
                    &[("task_type", task.task_type.as_str())],
                );
                self.events.publish(OrchestrationEvent::TaskCompleted {
                    task_id: task.id.clone(),
                });
                done
            }
            None => self.finish_cancelled(task, attempts, result.logs, started),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        task: &AgentTask,
        error: ErrorInfo,
        attempts: u32,
        logs: Vec<String>,
        started: Instant,
        routing: Option<&TaskRoutingResult>,
        control: &TaskControl,
    ) -> Arc<AgentTask> {
        let result = TaskResult {
            success: false,
            output: None,
            attempts,
            duration_ms: elapsed_ms(started),
            agent_id: routing.and_then(|r| r.agent_id.clone()),
            instance_id: routing.and_then(|r| r.instance_id().map(str::to_string)),
            logs,
        };
        let now = Utc::now();
        let settled = self
            .settle(&task.id, TaskStatus::Failed, control, |t| {
                t.result = Some(result.clone());
                t.error = Some(error.clone());
                t.completed_at = Some(now);
            })
            .await;
        match settled {
            Some(done) => {
                warn!(task_id = %task.id, code = %error.code, attempts, "task failed: {}", error.message);
                self.metrics.increment(
                    "task.execution.failure",
                    &[("task_type", task.task_type.as_str()), ("code", error.code.as_str())],
                );
                self.events.publish(OrchestrationEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error,
                });
                done
            }
            None => self.finish_cancelled(task, attempts, result.logs, started),
        }
    }

    fn finish_cancelled(
        &self,
        task: &AgentTask,
        attempts: u32,
        logs: Vec<String>,
        started: Instant,
    ) -> Arc<AgentTask> {
        let result = TaskResult {
            success: false,
            output: None,
            attempts,
            duration_ms: elapsed_ms(started),
            agent_id: None,
            instance_id: None,
            logs,
        };
        let now = Utc::now();
        let swapped = self.store.update(&task.id, |current| {
            let mut next = current.clone();
            match current.status {
                TaskStatus::Cancelled => {}
                status if status.can_transition_to(TaskStatus::Cancelled) => {
                    next.status = TaskStatus::Cancelled;
                    next.completed_at = Some(now);
                    next.error = Some(cancelled_error(&task.id));
                }
                status => {
                    return Err(SwitchyardError::InvalidTransition(format!(
                        "task {} already {}",
                        task.id, status
                    )))
                }
            }
            next.result = Some(TaskResult {
                agent_id: current.agent_id.clone(),
                instance_id: current.instance_id.clone(),
                ..result.clone()
            });
            Ok(next)
        });
        match swapped {
            Ok(swapped) => {
                if swapped.previous.status != TaskStatus::Cancelled {
                    self.note_cancelled(&task.id);
                }
                info!(task_id = %task.id, attempts, "task execution cancelled");
                swapped.current
            }
            Err(_) => self
                .store
                .get(&task.id)
                .unwrap_or_else(|| Arc::new(task.clone())),
        }
    }

    fn note_cancelled(&self, task_id: &str) {
        self.metrics.increment("task.cancelled", &[]);
        self.events.publish(OrchestrationEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
    }

    /// The task's control, and whether it was created by this call.
    fn control_for(&self, task_id: &str) -> (Arc<TaskControl>, bool) {
        let mut controls = self.controls.lock();
        if let Some(existing) = controls.get(task_id) {
            return (existing.clone(), false);
        }
        let control = Arc::new(TaskControl {
            cancel: self.root.child_token(),
            resumed: Notify::new(),
        });
        controls.insert(task_id.to_string(), control.clone());
        (control, true)
    }

    // --- control ---------------------------------------------------------

    /// Cancel a task that has not finished. A running attempt is interrupted.
    pub fn cancel_task(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        let now = Utc::now();
        let swapped = self.store.transition(task_id, TaskStatus::Cancelled, |t| {
            t.completed_at = Some(now);
            t.error = Some(cancelled_error(task_id));
        })?;
        let control = self.controls.lock().get(task_id).cloned();
        if let Some(control) = control {
            control.cancel.cancel();
            control.resumed.notify_waiters();
        }
        info!(task_id = %task_id, previous = %swapped.previous.status, "task cancelled");
        self.note_cancelled(task_id);
        Ok(swapped.current)
    }

    /// Hold a running task at its next attempt boundary.
    pub fn pause_task(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        let swapped = self.store.transition(task_id, TaskStatus::Paused, |_| {})?;
        info!(task_id = %task_id, "task paused");
        Ok(swapped.current)
    }

    /// Let a paused task continue.
    pub fn resume_task(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        let current = self.store.require(task_id)?;
        if current.status != TaskStatus::Paused {
            return Err(SwitchyardError::InvalidTransition(format!(
                "task {} is {}, not paused",
                task_id, current.status
            )));
        }
        let swapped = self.store.transition(task_id, TaskStatus::Running, |_| {})?;
        let control = self.controls.lock().get(task_id).cloned();
        if let Some(control) = control {
            control.resumed.notify_waiters();
        }
        info!(task_id = %task_id, "task resumed");
        Ok(swapped.current)
    }

    /// Put a failed or cancelled task back on the queue with a fresh retry budget.
    pub fn retry_task(&self, task_id: &str) -> SwitchyardResult<Arc<AgentTask>> {
        let now = Utc::now();
        let swapped = self.store.update(task_id, |current| {
            if !matches!(current.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(SwitchyardError::InvalidTransition(format!(
                    "task {} is {}; only failed or cancelled tasks can be retried",
                    task_id, current.status
                )));
            }
            let mut next = current.clone();
            next.status = TaskStatus::Queued;
            next.retry_count = 0;
            next.progress = 0;
            next.progress_message = None;
            next.result = None;
            next.error = None;
            next.completed_at = None;
            next.queued_at = Some(now);
            Ok(next)
        })?;
        self.controls.lock().remove(task_id);
        self.store.enqueue(task_id, swapped.current.priority);

        info!(task_id = %task_id, previous = %swapped.previous.status, "task requeued for retry");
        self.metrics.increment(
            "task.queued",
            &[("task_type", swapped.current.task_type.as_str())],
        );
        self.events.publish(OrchestrationEvent::TaskQueued {
            task_id: task_id.to_string(),
        });
        Ok(swapped.current)
    }

    /// Record progress on an active task; `percent` is clamped to 100.
    pub fn update_progress(
        &self,
        task_id: &str,
        percent: u32,
        message: Option<String>,
    ) -> SwitchyardResult<Arc<AgentTask>> {
        let percent = u8::try_from(percent.min(100)).unwrap_or(100);
        let swapped = self.store.update(task_id, |current| {
            if !matches!(
                current.status,
                TaskStatus::Running | TaskStatus::Paused | TaskStatus::Retrying
            ) {
                return Err(SwitchyardError::InvalidTransition(format!(
                    "task {} is {}; progress applies to active tasks",
                    task_id, current.status
                )));
            }
            let mut next = current.clone();
            next.progress = percent;
            next.progress_message = message.clone();
            Ok(next)
        })?;
        self.events.publish(OrchestrationEvent::TaskProgress {
            task_id: task_id.to_string(),
            percent,
            message,
        });
        Ok(swapped.current)
    }

    // --- queries ---------------------------------------------------------

    /// One task.
    pub fn get_task(&self, task_id: &str) -> Option<Arc<AgentTask>> {
        self.store.get(task_id)
    }

    /// Tasks, optionally of one status, oldest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Arc<AgentTask>> {
        self.store.list(status)
    }

    /// Counts per status.
    pub fn summary(&self) -> TaskSummary {
        self.store.summary()
    }

    // --- batches ---------------------------------------------------------

    /// Run several tasks, concurrently (bounded by `max_parallel`) or in order.
    ///
    /// With `fail_fast` the first failure cancels everything not yet finished.
    /// All tasks are validated before any is stored.
    pub async fn execute_batch(
        self: &Arc<Self>,
        tasks: Vec<AgentTask>,
        parallel: bool,
        fail_fast: bool,
    ) -> SwitchyardResult<BatchOutcome> {
        let mut seen = HashSet::new();
        for task in &tasks {
            self.check_new(task)?;
            if !seen.insert(task.id.clone()) {
                return Err(SwitchyardError::Validation(format!(
                    "task '{}' appears twice in the batch",
                    task.id
                )));
            }
        }
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in tasks {
            self.store.insert(task)?;
        }
        info!(tasks = ids.len(), parallel, fail_fast, "batch started");

        let mut errors = Vec::new();
        let mut aborted = false;
        if parallel {
            let mut workers = JoinSet::new();
            for id in ids.iter().cloned() {
                let executor = Arc::clone(self);
                let slots = Arc::clone(&self.batch_slots);
                workers.spawn(async move {
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return Err(SwitchyardError::Cancelled("batch workers closed".into()));
                    };
                    match executor.store.get(&id) {
                        Some(task) if task.status.is_terminal() => Ok(task),
                        _ => executor.execute(&id).await,
                    }
                });
            }
            while let Some(joined) = workers.join_next().await {
                let failed = match joined {
                    Ok(Ok(task)) => match (&task.status, &task.error) {
                        (TaskStatus::Failed, Some(error)) => {
                            errors.push(error.clone());
                            true
                        }
                        _ => false,
                    },
                    Ok(Err(e)) => {
                        errors.push(e.to_info());
                        true
                    }
                    Err(e) => {
                        errors.push(ErrorInfo::new(
                            codes::EXECUTION_FAILED,
                            format!("batch worker failed: {e}"),
                            Severity::Error,
                        ));
                        true
                    }
                };
                if failed && fail_fast && !aborted {
                    aborted = true;
                    self.abort_remaining(&ids);
                }
            }
        } else {
            for id in &ids {
                if aborted {
                    let _ = self.cancel_task(id);
                    continue;
                }
                let failed = match self.execute(id).await {
                    Ok(task) => match (&task.status, &task.error) {
                        (TaskStatus::Failed, Some(error)) => {
                            errors.push(error.clone());
                            true
                        }
                        _ => false,
                    },
                    Err(e) => {
                        errors.push(e.to_info());
                        true
                    }
                };
                aborted = failed && fail_fast;
            }
        }

        let finished: Vec<Arc<AgentTask>> = ids.iter().filter_map(|id| self.store.get(id)).collect();
        let status = batch_status(finished.iter().map(|t| t.status));
        info!(%status, errors = errors.len(), "batch finished");
        Ok(BatchOutcome {
            status,
            tasks: finished,
            errors,
        })
    }

    fn abort_remaining(&self, ids: &[String]) {
        warn!("batch failed fast, cancelling remaining tasks");
        for id in ids {
            if let Some(task) = self.store.get(id) {
                if !task.status.is_terminal() {
                    let _ = self.cancel_task(id);
                }
            }
        }
    }

    // --- background passes -----------------------------------------------

    fn dependencies_of(&self, task: &AgentTask) -> Dependencies {
        let mut ready = true;
        for dependency in &task.dependencies {
            match self.store.get(dependency).map(|d| d.status) {
                Some(TaskStatus::Completed) => {}
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Dependencies::Failed {
                        dependency: dependency.clone(),
                        status,
                    }
                }
                _ => ready = false,
            }
        }
        if ready {
            Dependencies::Ready
        } else {
            Dependencies::Waiting
        }
    }

    /// Dispatch due, unblocked queued tasks (at most `scheduler_batch_size`);
    /// everything else goes back on the queue.
    pub fn scheduler_pass(self: &Arc<Self>) -> SchedulerReport {
        let now = Utc::now();
        let mut report = SchedulerReport::default();
        let mut deferred = Vec::new();

        for id in self.store.drain_queue() {
            let Some(task) = self.store.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            if report.dispatched >= self.config.scheduler_batch_size || !task.is_due(now) {
                deferred.push(task);
                continue;
            }
            match self.dependencies_of(&task) {
                Dependencies::Waiting => deferred.push(task),
                Dependencies::Failed { dependency, status } => {
                    self.fail_on_dependency(&task, &dependency, status);
                    report.dependency_failures += 1;
                }
                Dependencies::Ready => {
                    report.dispatched += 1;
                    let executor = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = executor.execute(&id).await {
                            warn!(task_id = %id, error = %e, "scheduled task did not start");
                        }
                    });
                }
            }
        }

        report.deferred = deferred.len();
        for task in deferred {
            self.store.enqueue(&task.id, task.priority);
        }
        debug!(
            dispatched = report.dispatched,
            deferred = report.deferred,
            "scheduler pass complete"
        );
        report
    }

    fn fail_on_dependency(&self, task: &AgentTask, dependency: &str, status: TaskStatus) {
        let error = ErrorInfo::new(
            codes::DEPENDENCY_FAILED,
            format!("dependency {dependency} ended {status}"),
            Severity::Error,
        );
        let now = Utc::now();
        match self.store.transition(&task.id, TaskStatus::Failed, |t| {
            t.error = Some(error.clone());
            t.completed_at = Some(now);
        }) {
            Ok(_) => {
                warn!(task_id = %task.id, dependency = %dependency, %status, "task failed on dependency");
                self.events.publish(OrchestrationEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error,
                });
            }
            Err(e) => debug!(task_id = %task.id, error = %e, "dependency failure not applied"),
        }
    }

    /// Remove terminal tasks older than the retention window.
    pub fn cleanup_once(&self) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.config.retention()) else {
            return 0;
        };
        let purged = self.store.purge_terminal(cutoff);
        for task in &purged {
            self.metrics
                .increment("task.purged", &[("status", task.status.to_string().as_str())]);
        }
        if !purged.is_empty() {
            info!(purged = purged.len(), "terminal tasks purged");
        }
        purged.len()
    }

    /// Run the scheduler on its interval until cancelled.
    pub fn spawn_scheduler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let period = self.config.scheduler_interval();
        tokio::spawn(async move {
            run_periodic(cancel, period, period, || {
                let executor = executor.clone();
                async move {
                    executor.scheduler_pass();
                }
            })
            .await;
            debug!("task scheduler stopped");
        })
    }

    /// Run the cleanup pass on its interval until cancelled.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let period = self.config.cleanup_interval();
        tokio::spawn(async move {
            run_periodic(cancel, period, period, || {
                let executor = executor.clone();
                async move {
                    executor.cleanup_once();
                }
            })
            .await;
            debug!("task cleanup stopped");
        })
    }
}

fn cancelled_error(task_id: &str) -> ErrorInfo {
    ErrorInfo::new(
        codes::CANCELLED,
        format!("task {task_id} cancelled"),
        Severity::Info,
    )
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Aggregate status of a batch.
pub fn batch_status<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> TaskStatus {
    let statuses: Vec<TaskStatus> = statuses.into_iter().collect();
    if statuses.iter().all(|s| *s == TaskStatus::Completed) {
        TaskStatus::Completed
    } else if statuses.contains(&TaskStatus::Failed) {
        TaskStatus::Failed
    } else if statuses.contains(&TaskStatus::Cancelled) {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Running
    }
}
