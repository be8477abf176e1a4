use crate::config::CapabilityConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{
    run_periodic, CapabilityDescriptor, EventBus, HealthStatus, MetricsSink, NoopMetrics,
    OrchestrationEvent, SnapshotMap, SwitchyardError, SwitchyardResult,
};
use switchyard_runtime::{AgentRuntime, InstanceStatus, Invocation};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `(agent_id, capability_id)`.
pub type EntryKey = (String, String);

/// Rolling usage statistics for one capability entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityUsage {
    /// Invocations dispatched.
    pub total_executions: u64,
    /// Invocations that returned an error.
    pub failed_executions: u64,
    /// Running mean of invocation duration.
    pub average_duration_ms: f64,
    /// `failed_executions / total_executions`.
    pub error_rate: f64,
    /// Last invocation time.
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl CapabilityUsage {
    /// Fold one invocation outcome into the statistics.
    pub fn record(&self, duration_ms: f64, success: bool) -> Self {
        let total = self.total_executions + 1;
        let failed = self.failed_executions + u64::from(!success);
        #[allow(clippy::cast_precision_loss)]
        let (average, error_rate) = (
            self.average_duration_ms + (duration_ms - self.average_duration_ms) / total as f64,
            failed as f64 / total as f64,
        );
        Self {
            total_executions: total,
            failed_executions: failed,
            average_duration_ms: average,
            error_rate,
            last_executed_at: Some(Utc::now()),
        }
    }
}

/// One capability bound to one agent (and optionally a pinned instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRegistryEntry {
    /// The capability.
    pub capability: CapabilityDescriptor,
    /// Providing agent.
    pub agent_id: String,
    /// Pinned instance; `None` dispatches to any running instance of the agent.
    pub instance_id: Option<String>,
    /// Opaque endpoint reference supplied at registration.
    pub endpoint: Option<String>,
    /// Last observed health.
    pub health: HealthStatus,
    /// Whether the entry accepts invocations.
    pub available: bool,
    /// Usage statistics.
    pub usage: CapabilityUsage,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Last health check.
    pub last_health_check: Option<DateTime<Utc>>,
}

impl CapabilityRegistryEntry {
    /// Catalog key of this entry.
    pub fn key(&self) -> EntryKey {
        (self.agent_id.clone(), self.capability.id.clone())
    }
}

/// Conjunctive discovery filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityQuery {
    /// Category, case-insensitive.
    pub category: Option<String>,
    /// Every listed tag must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Permissions held by the caller; entries needing anything else are excluded.
    pub permissions: Option<Vec<String>>,
    /// Exact health.
    pub health: Option<HealthStatus>,
    /// Exact availability.
    pub available: Option<bool>,
}

impl CapabilityQuery {
    /// Empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: filter by category.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Builder: require a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: restrict to what these permissions allow.
    pub fn permissions<I, S>(mut self, held: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = Some(held.into_iter().map(Into::into).collect());
        self
    }

    /// Builder: filter by health.
    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    /// Builder: filter by availability.
    pub fn available(mut self, available: bool) -> Self {
        self.available = Some(available);
        self
    }

    fn matches(&self, entry: &CapabilityRegistryEntry) -> bool {
        if let Some(category) = &self.category {
            if !entry.capability.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if !self.tags.iter().all(|wanted| {
            entry
                .capability
                .tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case(wanted))
        }) {
            return false;
        }
        if let Some(held) = &self.permissions {
            if !entry
                .capability
                .required_permissions
                .iter()
                .all(|needed| held.contains(needed))
            {
                return false;
            }
        }
        if self.health.is_some_and(|h| h != entry.health) {
            return false;
        }
        if self.available.is_some_and(|a| a != entry.available) {
            return false;
        }
        true
    }
}

/// A capability invocation request.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    /// Capability to invoke.
    pub capability_id: String,
    /// Provider; when `None` the best available provider is chosen.
    pub agent_id: Option<String>,
    /// Instance override; otherwise the entry's pinned or best running instance.
    pub instance_id: Option<String>,
    /// Opaque input.
    pub input: Value,
    /// Opaque configuration.
    pub config: HashMap<String, Value>,
    /// Deadline.
    pub timeout: Duration,
}

impl CapabilityRequest {
    /// Request with defaults for everything but the capability and input.
    pub fn new(capability_id: impl Into<String>, input: Value) -> Self {
        Self {
            capability_id: capability_id.into(),
            agent_id: None,
            instance_id: None,
            input,
            config: HashMap::new(),
            timeout: Duration::from_secs(300),
        }
    }

    /// Builder: pin the provider.
    pub fn on_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Builder: pin the instance.
    pub fn on_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Builder: set the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: set configuration.
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }
}

/// Result of a successful capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Capability invoked.
    pub capability_id: String,
    /// Provider.
    pub agent_id: String,
    /// Instance that ran it.
    pub instance_id: String,
    /// Output payload.
    pub output: Value,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

#[derive(Default)]
struct Indexes {
    by_category: HashMap<String, BTreeSet<EntryKey>>,
    by_tag: HashMap<String, BTreeSet<EntryKey>>,
}

impl Indexes {
    fn add(&mut self, entry: &CapabilityRegistryEntry) {
        let key = entry.key();
        self.by_category
            .entry(entry.capability.category.to_lowercase())
            .or_default()
            .insert(key.clone());
        for tag in &entry.capability.tags {
            self.by_tag
                .entry(tag.to_lowercase())
                .or_default()
                .insert(key.clone());
        }
    }

    fn remove(&mut self, entry: &CapabilityRegistryEntry) {
        let key = entry.key();
        remove_from(&mut self.by_category, &entry.capability.category.to_lowercase(), &key);
        for tag in &entry.capability.tags {
            remove_from(&mut self.by_tag, &tag.to_lowercase(), &key);
        }
    }
}

fn remove_from(index: &mut HashMap<String, BTreeSet<EntryKey>>, bucket: &str, key: &EntryKey) {
    if let Some(set) = index.get_mut(bucket) {
        set.remove(key);
        if set.is_empty() {
            index.remove(bucket);
        }
    }
}

/// Catalog of capabilities offered by agents, with discovery and dispatch.
pub struct CapabilityRegistry {
    config: CapabilityConfig,
    runtime: Arc<AgentRuntime>,
    entries: SnapshotMap<EntryKey, CapabilityRegistryEntry>,
    indexes: RwLock<Indexes>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl CapabilityRegistry {
    /// Create an empty registry dispatching through `runtime`.
    pub fn new(config: CapabilityConfig, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            config,
            runtime,
            entries: SnapshotMap::new(),
            indexes: RwLock::new(Indexes::default()),
            events: EventBus::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Builder: publish capability events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Builder: emit counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register (or replace) a capability for an agent and run its initial health check.
    ///
    /// A pinned instance must exist in the runtime. A failing initial check
    /// marks the entry unhealthy; it does not reject the registration.
    pub async fn register_capability(
        &self,
        capability: CapabilityDescriptor,
        agent_id: &str,
        instance_id: Option<&str>,
        endpoint: Option<String>,
    ) -> SwitchyardResult<Arc<CapabilityRegistryEntry>> {
        capability.validate()?;
        if agent_id.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "capability '{}' needs an owning agent",
                capability.id
            )));
        }
        if let Some(iid) = instance_id {
            if self.runtime.get_instance(iid).is_none() {
                return Err(SwitchyardError::not_found("instance", iid));
            }
        }

        let entry = CapabilityRegistryEntry {
            capability,
            agent_id: agent_id.to_string(),
            instance_id: instance_id.map(str::to_string),
            endpoint,
            health: HealthStatus::Unknown,
            available: true,
            usage: CapabilityUsage::default(),
            registered_at: Utc::now(),
            last_health_check: None,
        };
        let key = entry.key();
        {
            let mut indexes = self.indexes.write();
            if let Some(previous) = self.entries.insert(key.clone(), entry.clone()) {
                indexes.remove(&previous);
            }
            indexes.add(&entry);
        }

        info!(agent_id = %key.0, capability_id = %key.1, "capability registered");
        self.metrics.increment(
            "capability.registered",
            &[("agent_id", key.0.as_str()), ("capability_id", key.1.as_str())],
        );
        self.events.publish(OrchestrationEvent::CapabilityRegistered {
            agent_id: key.0.clone(),
            capability_id: key.1.clone(),
        });

        let health = self.refresh_health(&key).await.unwrap_or(HealthStatus::Unhealthy);
        debug!(agent_id = %key.0, capability_id = %key.1, %health, "initial capability health");
        self.entries
            .get(&key)
            .ok_or_else(|| SwitchyardError::not_found("capability", &key.1))
    }

    /// Remove one entry. Returns whether it existed.
    pub fn unregister_capability(&self, agent_id: &str, capability_id: &str) -> bool {
        let key = (agent_id.to_string(), capability_id.to_string());
        let removed = {
            let mut indexes = self.indexes.write();
            let removed = self.entries.remove(&key);
            if let Some(entry) = &removed {
                indexes.remove(entry);
            }
            removed
        };
        match removed {
            Some(_) => {
                info!(agent_id = %agent_id, capability_id = %capability_id, "capability unregistered");
                self.events.publish(OrchestrationEvent::CapabilityUnregistered {
                    agent_id: agent_id.to_string(),
                    capability_id: capability_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Remove every entry of an agent. Returns how many were removed.
    pub fn unregister_agent_capabilities(&self, agent_id: &str) -> usize {
        self.capabilities_for_agent(agent_id)
            .iter()
            .filter(|e| self.unregister_capability(agent_id, &e.capability.id))
            .count()
    }

    /// One entry.
    pub fn get(&self, agent_id: &str, capability_id: &str) -> Option<Arc<CapabilityRegistryEntry>> {
        self.entries
            .get(&(agent_id.to_string(), capability_id.to_string()))
    }

    /// Entries of one agent, ordered by capability id.
    pub fn capabilities_for_agent(&self, agent_id: &str) -> Vec<Arc<CapabilityRegistryEntry>> {
        let mut found = self.entries.filter(|e| e.agent_id == agent_id);
        found.sort_by(|a, b| a.capability.id.cmp(&b.capability.id));
        found
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries matching every filter of `query`, ordered by category,
    /// capability id and agent id.
    pub fn discover(&self, query: &CapabilityQuery) -> Vec<Arc<CapabilityRegistryEntry>> {
        let mut found: Vec<_> = match &query.category {
            Some(category) => {
                let keys: Vec<EntryKey> = self
                    .indexes
                    .read()
                    .by_category
                    .get(&category.to_lowercase())
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                keys.iter()
                    .filter_map(|k| self.entries.get(k))
                    .filter(|e| query.matches(e))
                    .collect()
            }
            None => self.entries.filter(|e| query.matches(e)),
        };
        found.sort_by(|a, b| {
            a.capability
                .category
                .cmp(&b.capability.category)
                .then_with(|| a.capability.id.cmp(&b.capability.id))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        found
    }

    /// Entries carrying a tag.
    pub fn by_tag(&self, tag: &str) -> Vec<Arc<CapabilityRegistryEntry>> {
        let keys: Vec<EntryKey> = self
            .indexes
            .read()
            .by_tag
            .get(&tag.to_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter().filter_map(|k| self.entries.get(k)).collect()
    }

    /// Agents offering a capability in `category`.
    pub fn agents_with_category(&self, category: &str) -> BTreeSet<String> {
        self.indexes
            .read()
            .by_category
            .get(&category.to_lowercase())
            .map(|set| set.iter().map(|(agent, _)| agent.clone()).collect())
            .unwrap_or_default()
    }

    /// Agents offering `capability_id`, optionally only with the given health.
    pub fn agents_with_capability(
        &self,
        capability_id: &str,
        health: Option<HealthStatus>,
    ) -> BTreeSet<String> {
        self.entries
            .filter(|e| {
                e.capability.id == capability_id && health.map_or(true, |h| e.health == h)
            })
            .iter()
            .map(|e| e.agent_id.clone())
            .collect()
    }

    /// Usable entry of an agent whose id, or failing that category, matches `task_type`.
    pub fn match_for_task(&self, agent_id: &str, task_type: &str) -> Option<Arc<CapabilityRegistryEntry>> {
        let mut candidates = self.entries.filter(|e| {
            e.agent_id == agent_id
                && e.available
                && e.health != HealthStatus::Unhealthy
                && (e.capability.id.eq_ignore_ascii_case(task_type)
                    || e.capability.category.eq_ignore_ascii_case(task_type))
        });
        // Exact id matches first.
        candidates.sort_by_key(|e| (!e.capability.id.eq_ignore_ascii_case(task_type), e.capability.id.clone()));
        candidates.into_iter().next()
    }

    /// Set an entry's availability flag.
    pub fn set_available(&self, agent_id: &str, capability_id: &str, available: bool) -> SwitchyardResult<()> {
        let key = (agent_id.to_string(), capability_id.to_string());
        self.entries
            .update(&key, |current| {
                let mut next = current.clone();
                next.available = available;
                Ok::<_, SwitchyardError>(next)
            })
            .unwrap_or_else(|| Err(SwitchyardError::not_found("capability", capability_id)))
            .map(|_| ())
    }

    // --- execution -------------------------------------------------------

    /// Resolve, dispatch and account one capability invocation.
    pub async fn execute(&self, request: CapabilityRequest) -> SwitchyardResult<CapabilityResponse> {
        let entry = self.resolve_entry(&request)?;
        if !entry.available {
            return Err(SwitchyardError::Capability(format!(
                "capability '{}' on agent '{}' is unavailable",
                entry.capability.id, entry.agent_id
            )));
        }
        if entry.health == HealthStatus::Unhealthy {
            return Err(SwitchyardError::Capability(format!(
                "capability '{}' on agent '{}' is unhealthy",
                entry.capability.id, entry.agent_id
            )));
        }

        let instance_id = match request.instance_id.clone().or_else(|| entry.instance_id.clone()) {
            Some(iid) => iid,
            None => self
                .runtime
                .best_instance(&entry.agent_id, &[])
                .await
                .map(|i| i.id.clone())
                .ok_or_else(|| {
                    SwitchyardError::Capability(format!(
                        "no running instance of agent '{}' available for '{}'",
                        entry.agent_id, entry.capability.id
                    ))
                })?,
        };

        let invocation = Invocation::capability(&entry.capability.id, request.input, request.timeout)
            .with_config(request.config);
        let started = Instant::now();
        let result = self.runtime.invoke(&instance_id, invocation).await;
        let elapsed = started.elapsed();
        self.record_usage(&entry.key(), elapsed, result.is_ok());

        let tags = [
            ("agent_id", entry.agent_id.as_str()),
            ("capability_id", entry.capability.id.as_str()),
        ];
        match result {
            Ok(output) => {
                self.metrics.increment("capability.executed", &tags);
                Ok(CapabilityResponse {
                    capability_id: entry.capability.id.clone(),
                    agent_id: entry.agent_id.clone(),
                    instance_id,
                    output,
                    duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(e) => {
                self.metrics.increment("capability.failed", &tags);
                warn!(
                    agent_id = %entry.agent_id,
                    capability_id = %entry.capability.id,
                    instance_id = %instance_id,
                    error = %e,
                    "capability invocation failed"
                );
                Err(e)
            }
        }
    }

    fn resolve_entry(&self, request: &CapabilityRequest) -> SwitchyardResult<Arc<CapabilityRegistryEntry>> {
        if let Some(agent_id) = &request.agent_id {
            return self
                .get(agent_id, &request.capability_id)
                .ok_or_else(|| SwitchyardError::not_found("capability", &request.capability_id));
        }
        let mut providers = self
            .entries
            .filter(|e| e.capability.id == request.capability_id);
        if providers.is_empty() {
            return Err(SwitchyardError::not_found("capability", &request.capability_id));
        }
        providers.retain(|e| e.available && e.health != HealthStatus::Unhealthy);
        providers.sort_by(|a, b| {
            b.health
                .rank()
                .cmp(&a.health.rank())
                .then_with(|| a.usage.error_rate.total_cmp(&b.usage.error_rate))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        providers.into_iter().next().ok_or_else(|| {
            SwitchyardError::Capability(format!(
                "no provider of '{}' is currently available",
                request.capability_id
            ))
        })
    }

    fn record_usage(&self, key: &EntryKey, elapsed: Duration, success: bool) {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let _ = self.entries.update(key, |current| {
            let mut next = current.clone();
            next.usage = current.usage.record(duration_ms, success);
            Ok::<_, ()>(next)
        });
    }

    // --- health ----------------------------------------------------------

    /// Re-check one entry's health, store it, and return it.
    pub async fn check_capability_health(
        &self,
        agent_id: &str,
        capability_id: &str,
    ) -> SwitchyardResult<HealthStatus> {
        self.refresh_health(&(agent_id.to_string(), capability_id.to_string()))
            .await
    }

    async fn refresh_health(&self, key: &EntryKey) -> SwitchyardResult<HealthStatus> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| SwitchyardError::not_found("capability", &key.1))?;
        let health = self.assess_health(&entry).await;

        let swapped = self
            .entries
            .update(key, |current| {
                let mut next = current.clone();
                next.health = health;
                next.last_health_check = Some(Utc::now());
                Ok::<_, SwitchyardError>(next)
            })
            .unwrap_or_else(|| Err(SwitchyardError::not_found("capability", &key.1)))?;

        let previous = swapped.previous.health;
        if previous != health {
            info!(
                agent_id = %key.0,
                capability_id = %key.1,
                %previous,
                current = %health,
                "capability health changed"
            );
            self.events.publish(OrchestrationEvent::CapabilityHealthChanged {
                agent_id: key.0.clone(),
                capability_id: key.1.clone(),
                previous,
                current: health,
            });
        }
        Ok(health)
    }

    /// Health of an entry as seen through the runtime.
    ///
    /// A pinned instance that can no longer be found is `Degraded`, not
    /// removed. Without a pin the entry is healthy if any running instance of
    /// the agent is; an agent with no instances at all is `Unknown`.
    async fn assess_health(&self, entry: &CapabilityRegistryEntry) -> HealthStatus {
        if let Some(iid) = &entry.instance_id {
            if self.runtime.get_instance(iid).is_none() {
                return HealthStatus::Degraded;
            }
            return self.runtime.check_instance_health(iid).await;
        }
        let instances = self.runtime.agent_instance_health(&entry.agent_id).await;
        if instances.is_empty() {
            return HealthStatus::Unknown;
        }
        let running = instances
            .iter()
            .filter(|(i, _)| i.status == InstanceStatus::Running)
            .map(|(_, h)| *h);
        match HealthStatus::best(running) {
            HealthStatus::Unknown => HealthStatus::Unhealthy,
            best => best,
        }
    }

    /// Re-check every entry; returns how many changed health.
    pub async fn health_sweep_once(&self) -> usize {
        let mut changed = 0;
        for key in self.entries.keys() {
            let before = self.entries.get(&key).map(|e| e.health);
            match self.refresh_health(&key).await {
                Ok(after) if Some(after) != before => changed += 1,
                Ok(_) => {}
                Err(e) => warn!(agent_id = %key.0, capability_id = %key.1, error = %e, "capability health check failed"),
            }
        }
        debug!(entries = self.entries.len(), changed, "capability health sweep complete");
        changed
    }

    /// Run the health sweep on the configured schedule until cancelled.
    pub fn spawn_health_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let (delay, interval) = (self.config.initial_delay(), self.config.interval());
        tokio::spawn(async move {
            run_periodic(cancel, delay, interval, || {
                let registry = registry.clone();
                async move {
                    registry.health_sweep_once().await;
                }
            })
            .await;
        })
    }
}
