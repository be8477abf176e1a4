use crate::config::RuntimeConfig;
use crate::endpoint::{AgentEndpoint, Invocation};
use crate::instance::{AgentInstance, InstanceConfig, InstanceStatus, ResourceUsage};
use crate::process::{LaunchSpec, ProcessControl, ProcessState};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::{
    codes, run_periodic, AgentDefinition, ErrorInfo, EventBus, HealthStatus, MetricsSink,
    NoopMetrics, OrchestrationEvent, Severity, SnapshotMap, SwitchyardError, SwitchyardResult,
    Swapped,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of one monitor sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Instances inspected.
    pub checked: usize,
    /// Instances moved to `Failed` because their process exited.
    pub exited: usize,
    /// Usage samples that could not be taken.
    pub sample_errors: usize,
}

/// Owns every agent instance and the processes behind them.
///
/// All instance mutation goes through compare-and-swap on the instance
/// catalog; no lock is held while the process layer is awaited.
pub struct AgentRuntime {
    config: RuntimeConfig,
    instances: SnapshotMap<String, AgentInstance>,
    definitions: SnapshotMap<String, AgentDefinition>,
    process: Arc<dyn ProcessControl>,
    endpoint: Arc<dyn AgentEndpoint>,
    user_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

/// Decrements an instance's active invocation count when dropped.
struct InvocationGuard<'a> {
    instances: &'a SnapshotMap<String, AgentInstance>,
    id: String,
    succeeded: bool,
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        let _ = self.instances.update(&self.id, |current| {
            let mut next = current.clone();
            next.active_invocations = next.active_invocations.saturating_sub(1);
            next.total_invocations = next.total_invocations.saturating_add(1);
            Ok::<_, ()>(next)
        });
        debug!(instance_id = %self.id, succeeded = self.succeeded, "invocation finished");
    }
}

impl AgentRuntime {
    /// Create a runtime over the given process layer and endpoint.
    pub fn new(
        config: RuntimeConfig,
        process: Arc<dyn ProcessControl>,
        endpoint: Arc<dyn AgentEndpoint>,
    ) -> Self {
        Self {
            config,
            instances: SnapshotMap::new(),
            definitions: SnapshotMap::new(),
            process,
            endpoint,
            user_slots: Mutex::new(HashMap::new()),
            permits: Mutex::new(HashMap::new()),
            events: EventBus::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Builder: publish lifecycle events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Builder: emit counters and gauges to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The event bus instance events are published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // --- lifecycle -------------------------------------------------------

    /// Allocate a working directory and record a `Stopped` instance.
    ///
    /// Blocks while `user` is at its live-instance ceiling.
    pub async fn create_instance(
        &self,
        definition: &AgentDefinition,
        config: Option<InstanceConfig>,
        user: &str,
    ) -> SwitchyardResult<AgentInstance> {
        if user.trim().is_empty() {
            return Err(SwitchyardError::Validation(
                "creating an instance requires a user or tenant identity".into(),
            ));
        }
        definition.validate()?;

        let slots = self.user_slots(user);
        let permit = slots
            .acquire_owned()
            .await
            .map_err(|_| SwitchyardError::Process("instance limiter closed".into()))?;

        let config = config.unwrap_or_default();
        let id = Uuid::new_v4().to_string();
        let working_dir = config
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.work_root.join(&id));
        tokio::fs::create_dir_all(&working_dir).await?;

        let mut environment = definition.environment.clone();
        environment.extend(config.environment);
        environment.insert("SWITCHYARD_INSTANCE_ID".into(), id.clone());
        environment.insert("SWITCHYARD_AGENT_ID".into(), definition.id.clone());
        environment.insert(
            "SWITCHYARD_WORK_DIR".into(),
            working_dir.display().to_string(),
        );

        let mut args = definition.args.clone();
        args.extend(config.extra_args);

        let instance = AgentInstance {
            id: id.clone(),
            agent_id: definition.id.clone(),
            status: InstanceStatus::Stopped,
            working_dir,
            environment,
            args,
            pid: None,
            resource_usage: ResourceUsage::default(),
            owner: user.to_string(),
            active_invocations: 0,
            total_invocations: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        };

        self.definitions.insert(id.clone(), definition.clone());
        self.instances.insert(id.clone(), instance.clone());
        self.permits.lock().insert(id.clone(), permit);

        info!(instance_id = %id, agent_id = %definition.id, owner = %user, "instance created");
        self.metrics
            .increment("instance.created", &[("agent_id", definition.id.as_str())]);
        self.events.publish(OrchestrationEvent::InstanceCreated {
            instance_id: id,
            agent_id: definition.id.clone(),
        });
        Ok(instance)
    }

    /// Launch the instance's process: `Stopped|Failed → Starting → Running`.
    ///
    /// A launch failure moves the instance to `Failed` with `START_FAILED`
    /// and is returned to the caller.
    pub async fn start_instance(&self, instance_id: &str) -> SwitchyardResult<AgentInstance> {
        let starting = self.transition(instance_id, InstanceStatus::Starting, |i| {
            i.last_error = None;
        })?;
        let definition = self
            .definitions
            .get(&instance_id.to_string())
            .ok_or_else(|| SwitchyardError::not_found("agent definition", instance_id))?;

        let spec = LaunchSpec {
            program: definition.entrypoint.clone(),
            args: starting.current.args.clone(),
            environment: starting.current.environment.clone(),
            working_dir: starting.current.working_dir.clone(),
        };

        let launched = match tokio::fs::create_dir_all(&spec.working_dir).await {
            Ok(()) => self.process.spawn(&spec).await,
            Err(e) => Err(e.into()),
        };
        let pid = match launched {
            Ok(pid) => pid,
            Err(e) => {
                self.fail_instance(instance_id, e.to_info_with_code(codes::START_FAILED));
                return Err(e);
            }
        };

        match self.transition(instance_id, InstanceStatus::Running, |i| {
            i.pid = Some(pid);
            i.started_at = Some(Utc::now());
            i.stopped_at = None;
        }) {
            Ok(swapped) => {
                info!(instance_id = %instance_id, pid, "instance started");
                self.metrics.increment(
                    "instance.started",
                    &[("agent_id", swapped.current.agent_id.as_str())],
                );
                self.events.publish(OrchestrationEvent::InstanceStarted {
                    instance_id: instance_id.to_string(),
                });
                Ok((*swapped.current).clone())
            }
            Err(e) => {
                // Lost a race (destroyed or failed meanwhile); don't orphan the process.
                warn!(instance_id = %instance_id, pid, error = %e, "instance changed during start");
                let _ = self.process.kill(pid).await;
                self.process.release(pid).await;
                Err(e)
            }
        }
    }

    /// Stop the instance's process and transition to `Stopped`.
    ///
    /// With `graceful`, a cooperative shutdown is requested first and the
    /// process is killed only after the grace period. Stopping a stopped
    /// instance is a no-op; stopping a paused one is rejected.
    pub async fn stop_instance(
        &self,
        instance_id: &str,
        graceful: bool,
    ) -> SwitchyardResult<AgentInstance> {
        let current = self.require(instance_id)?;
        match current.status {
            InstanceStatus::Stopped => return Ok((*current).clone()),
            InstanceStatus::Paused => {
                return Err(SwitchyardError::InvalidTransition(format!(
                    "instance {} is paused; resume it before stopping",
                    instance_id
                )))
            }
            _ => {}
        }

        let stopping = self.transition(instance_id, InstanceStatus::Stopping, |_| {})?;
        if let Some(pid) = stopping.current.pid {
            if let Err(e) = self.terminate(pid, graceful).await {
                self.fail_instance(instance_id, e.to_info_with_code(codes::STOP_FAILED));
                return Err(e);
            }
            self.process.release(pid).await;
        }

        let stopped = self.transition(instance_id, InstanceStatus::Stopped, |i| {
            i.pid = None;
            i.active_invocations = 0;
            i.stopped_at = Some(Utc::now());
        })?;

        if self.config.cleanup_work_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&stopped.current.working_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        instance_id = %instance_id,
                        dir = %stopped.current.working_dir.display(),
                        error = %e,
                        "failed to remove working directory"
                    );
                }
            }
        }

        info!(instance_id = %instance_id, graceful, "instance stopped");
        self.metrics.increment(
            "instance.stopped",
            &[("agent_id", stopped.current.agent_id.as_str())],
        );
        self.events.publish(OrchestrationEvent::InstanceStopped {
            instance_id: instance_id.to_string(),
        });
        Ok((*stopped.current).clone())
    }

    async fn terminate(&self, pid: u32, graceful: bool) -> SwitchyardResult<()> {
        if graceful {
            match self.process.signal_shutdown(pid).await {
                Ok(()) => {
                    if self.process.wait_exit(pid, self.config.grace_period()).await {
                        return Ok(());
                    }
                    warn!(pid, "grace period elapsed; forcing termination");
                }
                Err(e) => warn!(pid, error = %e, "cooperative shutdown failed; forcing termination"),
            }
        }
        if !self.process.state(pid).await.is_alive() {
            return Ok(());
        }
        self.process.kill(pid).await?;
        if self
            .process
            .wait_exit(pid, std::time::Duration::from_secs(5))
            .await
        {
            Ok(())
        } else {
            Err(SwitchyardError::Process(format!(
                "process {} survived forced termination",
                pid
            )))
        }
    }

    /// Suspend a `Running` instance.
    pub async fn pause_instance(&self, instance_id: &str) -> SwitchyardResult<AgentInstance> {
        let current = self.require(instance_id)?;
        if current.status != InstanceStatus::Running {
            return Err(SwitchyardError::InvalidTransition(format!(
                "cannot pause instance {} in state {}",
                instance_id, current.status
            )));
        }
        let pid = current.pid.ok_or_else(|| {
            SwitchyardError::Process(format!("running instance {} has no process", instance_id))
        })?;
        self.process.suspend(pid).await?;

        match self.transition(instance_id, InstanceStatus::Paused, |_| {}) {
            Ok(swapped) => {
                info!(instance_id = %instance_id, "instance paused");
                self.events.publish(OrchestrationEvent::InstancePaused {
                    instance_id: instance_id.to_string(),
                });
                Ok((*swapped.current).clone())
            }
            Err(e) => {
                let _ = self.process.resume(pid).await;
                Err(e)
            }
        }
    }

    /// Resume a `Paused` instance.
    pub async fn resume_instance(&self, instance_id: &str) -> SwitchyardResult<AgentInstance> {
        let current = self.require(instance_id)?;
        if current.status != InstanceStatus::Paused {
            return Err(SwitchyardError::InvalidTransition(format!(
                "cannot resume instance {} in state {}",
                instance_id, current.status
            )));
        }
        let pid = current.pid.ok_or_else(|| {
            SwitchyardError::Process(format!("paused instance {} has no process", instance_id))
        })?;
        self.process.resume(pid).await?;

        let swapped = self.transition(instance_id, InstanceStatus::Running, |_| {})?;
        info!(instance_id = %instance_id, "instance resumed");
        self.events.publish(OrchestrationEvent::InstanceResumed {
            instance_id: instance_id.to_string(),
        });
        Ok((*swapped.current).clone())
    }

    /// Stop (if needed) and remove an instance.
    ///
    /// Returns `false` when no such instance exists. With `force`, a failed
    /// stop is logged and the record is removed anyway.
    pub async fn destroy_instance(&self, instance_id: &str, force: bool) -> SwitchyardResult<bool> {
        let Some(current) = self.instances.get(&instance_id.to_string()) else {
            return Ok(false);
        };

        if current.status == InstanceStatus::Paused {
            if let Err(e) = self.resume_instance(instance_id).await {
                if !force {
                    return Err(e);
                }
                warn!(instance_id = %instance_id, error = %e, "resume before destroy failed");
            }
        }

        if current.status != InstanceStatus::Stopped {
            if let Err(e) = self.stop_instance(instance_id, !force).await {
                if !force {
                    return Err(e);
                }
                warn!(instance_id = %instance_id, error = %e, "stop before destroy failed");
                if let Some(pid) = self.get_instance(instance_id).and_then(|i| i.pid) {
                    let _ = self.process.kill(pid).await;
                    self.process.release(pid).await;
                }
            }
        }

        let removed = self.instances.remove(&instance_id.to_string());
        self.definitions.remove(&instance_id.to_string());
        self.permits.lock().remove(instance_id);

        match removed {
            Some(instance) => {
                info!(instance_id = %instance_id, "instance destroyed");
                self.metrics.increment(
                    "instance.destroyed",
                    &[("agent_id", instance.agent_id.as_str())],
                );
                self.events.publish(OrchestrationEvent::InstanceDestroyed {
                    instance_id: instance_id.to_string(),
                });
                Ok(true)
            }
            // A concurrent destroy got there first.
            None => Ok(false),
        }
    }

    /// Stop every instance that has a process. Used on shutdown.
    pub async fn stop_all(&self) {
        for instance in self.list_instances() {
            if !instance.status.has_process() {
                continue;
            }
            if instance.status == InstanceStatus::Paused {
                if let Err(e) = self.resume_instance(&instance.id).await {
                    warn!(instance_id = %instance.id, error = %e, "resume during shutdown failed");
                }
            }
            if let Err(e) = self.stop_instance(&instance.id, true).await {
                warn!(instance_id = %instance.id, error = %e, "stop during shutdown failed");
            }
        }
    }

    // --- health & monitoring --------------------------------------------

    /// Health of one instance as seen by the process layer.
    pub async fn check_instance_health(&self, instance_id: &str) -> HealthStatus {
        let Some(instance) = self.instances.get(&instance_id.to_string()) else {
            return HealthStatus::Unknown;
        };
        match instance.status {
            InstanceStatus::Stopped | InstanceStatus::Stopping | InstanceStatus::Failed => {
                return HealthStatus::Unhealthy
            }
            InstanceStatus::Starting | InstanceStatus::Paused | InstanceStatus::Running => {}
        }
        let Some(pid) = instance.pid else {
            return if instance.status == InstanceStatus::Starting {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
        };
        match self.process.state(pid).await {
            ProcessState::Exited { .. } | ProcessState::Missing => HealthStatus::Unhealthy,
            ProcessState::Alive { responsive: false } => HealthStatus::Degraded,
            ProcessState::Alive { responsive: true } => {
                if instance.status == InstanceStatus::Running {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                }
            }
        }
    }

    /// One monitor sweep: fail instances whose process exited, sample the rest.
    pub async fn monitor_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();
        let watched = self
            .instances
            .filter(|i| matches!(i.status, InstanceStatus::Running | InstanceStatus::Paused));

        for instance in watched {
            let Some(pid) = instance.pid else { continue };
            report.checked += 1;

            match self.process.state(pid).await {
                state @ (ProcessState::Exited { .. } | ProcessState::Missing) => {
                    let message = match state {
                        ProcessState::Exited { code: Some(code) } => {
                            format!("process {} exited unexpectedly with code {}", pid, code)
                        }
                        _ => format!("process {} exited unexpectedly", pid),
                    };
                    // A concurrent stop or restart owns the instance now.
                    let failed = self.fail_instance_if(
                        &instance.id,
                        ErrorInfo::new(codes::PROCESS_EXITED, message, Severity::Error),
                        |current| {
                            matches!(current.status, InstanceStatus::Running | InstanceStatus::Paused)
                                && current.pid == Some(pid)
                        },
                    );
                    if failed {
                        self.process.release(pid).await;
                        report.exited += 1;
                    } else {
                        debug!(instance_id = %instance.id, pid, "exit already handled elsewhere");
                    }
                }
                ProcessState::Alive { .. } => match self.process.usage(pid).await {
                    Ok(usage) => {
                        let tags = [
                            ("instance_id", instance.id.as_str()),
                            ("agent_id", instance.agent_id.as_str()),
                        ];
                        self.metrics
                            .gauge("instance.cpu_percent", usage.cpu_percent, &tags);
                        #[allow(clippy::cast_precision_loss)]
                        self.metrics
                            .gauge("instance.memory_bytes", usage.memory_bytes as f64, &tags);
                        let _ = self.instances.update(&instance.id, |current| {
                            let mut next = current.clone();
                            next.resource_usage = usage;
                            Ok::<_, ()>(next)
                        });
                    }
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "usage sample failed");
                        report.sample_errors += 1;
                    }
                },
            }
        }

        debug!(
            checked = report.checked,
            exited = report.exited,
            "instance monitor sweep complete"
        );
        report
    }

    /// Run [`monitor_once`](Self::monitor_once) on the configured interval until cancelled.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let period = self.config.monitor_interval();
        tokio::spawn(async move {
            run_periodic(cancel, period, period, || {
                let runtime = runtime.clone();
                async move {
                    runtime.monitor_once().await;
                }
            })
            .await;
            debug!("instance monitor stopped");
        })
    }

    // --- invocation ------------------------------------------------------

    /// Dispatch `invocation` to a running instance, bounded by its timeout.
    pub async fn invoke(&self, instance_id: &str, invocation: Invocation) -> SwitchyardResult<Value> {
        let key = instance_id.to_string();
        let admitted = self
            .instances
            .update(&key, |current| {
                if current.status != InstanceStatus::Running {
                    return Err(SwitchyardError::Execution(format!(
                        "instance {} unavailable: status {}",
                        current.id, current.status
                    )));
                }
                let mut next = current.clone();
                next.active_invocations += 1;
                Ok(next)
            })
            .unwrap_or_else(|| Err(SwitchyardError::not_found("instance", instance_id)))?;
        let definition = self
            .definitions
            .get(&key)
            .ok_or_else(|| SwitchyardError::not_found("agent definition", instance_id))?;

        let mut guard = InvocationGuard {
            instances: &self.instances,
            id: key,
            succeeded: false,
        };
        let timeout = invocation.timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.endpoint
                .invoke(&admitted.current, &definition, &invocation),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SwitchyardError::Timeout(format!(
                "invocation on instance {} timeout after {}ms",
                instance_id,
                timeout.as_millis()
            ))),
        };
        guard.succeeded = result.is_ok();
        result
    }

    // --- queries ---------------------------------------------------------

    /// Snapshot of one instance.
    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<AgentInstance>> {
        self.instances.get(&instance_id.to_string())
    }

    /// Definition an instance was created from.
    pub fn definition_of(&self, instance_id: &str) -> Option<Arc<AgentDefinition>> {
        self.definitions.get(&instance_id.to_string())
    }

    /// All instances, oldest first.
    pub fn list_instances(&self) -> Vec<Arc<AgentInstance>> {
        let mut all = self.instances.values();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Instances of one agent, oldest first.
    pub fn instances_for_agent(&self, agent_id: &str) -> Vec<Arc<AgentInstance>> {
        let mut found = self.instances.filter(|i| i.agent_id == agent_id);
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found
    }

    /// Health of every instance of an agent.
    pub async fn agent_instance_health(&self, agent_id: &str) -> Vec<(Arc<AgentInstance>, HealthStatus)> {
        let mut out = Vec::new();
        for instance in self.instances_for_agent(agent_id) {
            let health = self.check_instance_health(&instance.id).await;
            out.push((instance, health));
        }
        out
    }

    /// Best running instance of an agent, skipping `exclude`.
    ///
    /// Healthy beats degraded; ties go to the fewest active invocations,
    /// then the oldest instance.
    pub async fn best_instance(
        &self,
        agent_id: &str,
        exclude: &[String],
    ) -> Option<Arc<AgentInstance>> {
        let mut best: Option<(Arc<AgentInstance>, HealthStatus)> = None;
        for (instance, health) in self.agent_instance_health(agent_id).await {
            if !instance.is_running() || !health.is_usable() || exclude.contains(&instance.id) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((b, bh)) => {
                    health.rank() > bh.rank()
                        || (health == *bh && instance.active_invocations < b.active_invocations)
                }
            };
            if better {
                best = Some((instance, health));
            }
        }
        best.map(|(i, _)| i)
    }

    // --- internals -------------------------------------------------------

    fn require(&self, instance_id: &str) -> SwitchyardResult<Arc<AgentInstance>> {
        self.instances
            .get(&instance_id.to_string())
            .ok_or_else(|| SwitchyardError::not_found("instance", instance_id))
    }

    fn transition<F>(
        &self,
        instance_id: &str,
        to: InstanceStatus,
        mutate: F,
    ) -> SwitchyardResult<Swapped<AgentInstance>>
    where
        F: FnOnce(&mut AgentInstance),
    {
        self.instances
            .update(&instance_id.to_string(), |current| {
                if !current.status.can_transition_to(to) {
                    return Err(SwitchyardError::InvalidTransition(format!(
                        "instance {} cannot move from {} to {}",
                        current.id, current.status, to
                    )));
                }
                let mut next = current.clone();
                next.status = to;
                mutate(&mut next);
                Ok(next)
            })
            .unwrap_or_else(|| Err(SwitchyardError::not_found("instance", instance_id)))
    }

    fn fail_instance(&self, instance_id: &str, error: ErrorInfo) {
        self.fail_instance_if(instance_id, error, |_| true);
    }

    /// Move the instance to `Failed` if `guard` still holds for its current
    /// snapshot. Returns whether the failure was recorded.
    fn fail_instance_if<G>(&self, instance_id: &str, error: ErrorInfo, guard: G) -> bool
    where
        G: FnOnce(&AgentInstance) -> bool,
    {
        let attached = error.clone();
        // `Err(None)`: the guard no longer holds.
        let result = self
            .instances
            .update(&instance_id.to_string(), |current| {
                if !guard(current) {
                    return Err(None);
                }
                if !current.status.can_transition_to(InstanceStatus::Failed) {
                    return Err(Some(SwitchyardError::InvalidTransition(format!(
                        "instance {} cannot move from {} to {}",
                        current.id,
                        current.status,
                        InstanceStatus::Failed
                    ))));
                }
                let mut next = current.clone();
                next.status = InstanceStatus::Failed;
                next.last_error = Some(attached);
                next.active_invocations = 0;
                Ok(next)
            })
            .unwrap_or_else(|| Err(Some(SwitchyardError::not_found("instance", instance_id))));
        match result {
            Ok(swapped) => {
                error!(
                    instance_id = %instance_id,
                    code = %error.code,
                    error = %error.message,
                    "instance failed"
                );
                self.metrics.increment(
                    "instance.failed",
                    &[
                        ("agent_id", swapped.current.agent_id.as_str()),
                        ("code", error.code.as_str()),
                    ],
                );
                self.events.publish(OrchestrationEvent::InstanceFailed {
                    instance_id: instance_id.to_string(),
                    error,
                });
                true
            }
            Err(None) => false,
            Err(Some(e)) => {
                warn!(instance_id = %instance_id, error = %e, "could not record instance failure");
                false
            }
        }
    }

    fn user_slots(&self, user: &str) -> Arc<Semaphore> {
        let max = self.config.max_instances_per_user.max(1);
        self.user_slots
            .lock()
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max)))
            .clone()
    }
}
