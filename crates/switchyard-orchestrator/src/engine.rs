use crate::config::SwitchyardConfig;
use crate::executor::TaskExecutor;
use crate::router::TaskRouter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchyard_core::{
    AgentDefinition, CapabilityDescriptor, EventBus, MetricsSink, SwitchyardError, SwitchyardResult,
    TracingMetrics,
};
use switchyard_registry::{AgentRegistry, CapabilityRegistry, ManifestLoader};
use switchyard_runtime::{
    AgentEndpoint, AgentInstance, AgentRuntime, EchoEndpoint, LocalProcessControl,
    ProcessControl, ProcessEndpoint, SimulatedProcessControl,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: SwitchyardConfig,
    process: Option<(Arc<dyn ProcessControl>, Arc<dyn AgentEndpoint>)>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl OrchestratorBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: SwitchyardConfig) -> Self {
        self.config = config;
        self
    }

    /// Run agents through `process`, invoking them through `endpoint`.
    pub fn process(mut self, process: Arc<dyn ProcessControl>, endpoint: Arc<dyn AgentEndpoint>) -> Self {
        self.process = Some((process, endpoint));
        self
    }

    /// Run agents in-process: simulated processes answered by an echo endpoint.
    pub fn simulated(self) -> Self {
        self.process(Arc::new(SimulatedProcessControl::new()), Arc::new(EchoEndpoint))
    }

    /// Share `events` with the caller.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Emit counters and gauges to `metrics` (default: tracing).
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Wire every component together. Nothing runs until [`Orchestrator::start`].
    pub fn build(self) -> Orchestrator {
        let (process, endpoint) = self.process.unwrap_or_else(|| {
            let local = Arc::new(LocalProcessControl::new());
            let endpoint: Arc<dyn AgentEndpoint> = Arc::new(ProcessEndpoint::new(local.clone()));
            (local as Arc<dyn ProcessControl>, endpoint)
        });
        let config = self.config;
        let shutdown = CancellationToken::new();

        let runtime = Arc::new(
            AgentRuntime::new(config.runtime.clone(), process, endpoint)
                .with_events(self.events.clone())
                .with_metrics(self.metrics.clone()),
        );
        let capabilities = Arc::new(
            CapabilityRegistry::new(config.capabilities.clone(), runtime.clone())
                .with_events(self.events.clone())
                .with_metrics(self.metrics.clone()),
        );
        let agents = Arc::new(
            AgentRegistry::new(config.registry.clone(), capabilities.clone(), runtime.clone())
                .with_events(self.events.clone())
                .with_metrics(self.metrics.clone()),
        );
        let router = Arc::new(TaskRouter::new(agents.clone()).with_metrics(self.metrics.clone()));
        let executor = Arc::new(
            TaskExecutor::new(config.executor.clone(), router.clone(), agents.clone())
                .with_events(self.events.clone())
                .with_metrics(self.metrics.clone())
                .with_cancellation(shutdown.child_token()),
        );

        Orchestrator {
            config,
            events: self.events,
            runtime,
            capabilities,
            agents,
            router,
            executor,
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

/// The assembled engine: runtime, registries, router and executor, plus the
/// background loops that keep them current.
pub struct Orchestrator {
    config: SwitchyardConfig,
    events: EventBus,
    runtime: Arc<AgentRuntime>,
    capabilities: Arc<CapabilityRegistry>,
    agents: Arc<AgentRegistry>,
    router: Arc<TaskRouter>,
    executor: Arc<TaskExecutor>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: SwitchyardConfig::default(),
            process: None,
            events: EventBus::default(),
            metrics: Arc::new(TracingMetrics),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &SwitchyardConfig {
        &self.config
    }

    /// Event bus shared by every component.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Agent runtime.
    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Capability registry.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Agent registry.
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    /// Task router.
    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    /// Task executor.
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Spawn the background loops: instance monitor, capability health sweep,
    /// agent metrics refresh, task scheduler and task cleanup.
    ///
    /// Only the first call has an effect.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        handles.push(self.runtime.spawn_monitor(self.shutdown.child_token()));
        handles.push(self.capabilities.spawn_health_sweep(self.shutdown.child_token()));
        handles.push(self.agents.spawn_metrics_refresh(self.shutdown.child_token()));
        handles.push(self.executor.spawn_scheduler(self.shutdown.child_token()));
        handles.push(self.executor.spawn_cleanup(self.shutdown.child_token()));
        info!(loops = handles.len(), owner = %self.config.owner, "orchestrator started");
    }

    /// Register agents as `loader` loads and unloads their manifests.
    pub fn follow(&self, loader: &ManifestLoader) {
        let handle = self
            .agents
            .attach_loader(loader.subscribe(), self.shutdown.child_token());
        self.handles.lock().push(handle);
    }

    /// Register an agent with its capabilities and start `instances` instances of it.
    pub async fn deploy(
        &self,
        definition: AgentDefinition,
        capabilities: Vec<CapabilityDescriptor>,
        instances: usize,
    ) -> SwitchyardResult<Vec<AgentInstance>> {
        let agent_id = definition.id.clone();
        self.agents
            .register_with_capabilities(definition, capabilities)
            .await?;
        let registered = self
            .agents
            .get(&agent_id)
            .ok_or_else(|| SwitchyardError::not_found("agent", agent_id.as_str()))?;
        let mut started = Vec::with_capacity(instances);
        for _ in 0..instances {
            let created = self
                .runtime
                .create_instance(&registered, None, &self.config.owner)
                .await?;
            started.push(self.runtime.start_instance(&created.id).await?);
        }
        info!(agent_id = %registered.id, instances = started.len(), "agent deployed");
        Ok(started)
    }

    /// Stop the loops, cancel in-flight tasks and stop every instance.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        self.runtime.stop_all().await;
        info!("orchestrator stopped");
    }
}
