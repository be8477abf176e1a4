use crate::capabilities::{CapabilityQuery, CapabilityRegistry};
use crate::config::RegistryConfig;
use crate::loader::LoaderEvent;
use crate::metrics::{
    instance_load, performance_score, reliability_score, ExecutionLedger, LoadMetrics,
    PerformanceMetrics,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use switchyard_core::{
    run_periodic, AgentDefinition, CapabilityDescriptor, EventBus, HealthStatus, MetricsSink,
    NoopMetrics, OrchestrationEvent, SnapshotMap, SwitchyardError, SwitchyardResult,
};
use switchyard_runtime::AgentRuntime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Filters for [`AgentRegistry::list_agents`], applied health, type, tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    /// Keep agents with at least one instance in this health.
    pub health: Option<HealthStatus>,
    /// Keep agents of this type (case-insensitive).
    pub agent_type: Option<String>,
    /// Keep agents carrying this tag (case-insensitive).
    pub tag: Option<String>,
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching agent.
    pub agent: Arc<AgentDefinition>,
    /// Summed field score.
    pub score: u32,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    definition: Arc<AgentDefinition>,
    seq: u64,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Catalog {
    agents: HashMap<String, CatalogEntry>,
    by_type: HashMap<String, BTreeSet<String>>,
    by_tag: HashMap<String, BTreeSet<String>>,
    next_seq: u64,
}

impl Catalog {
    fn index(&mut self, definition: &AgentDefinition) {
        self.by_type
            .entry(definition.agent_type.to_lowercase())
            .or_default()
            .insert(definition.id.clone());
        for tag in &definition.tags {
            self.by_tag
                .entry(tag.to_lowercase())
                .or_default()
                .insert(definition.id.clone());
        }
    }

    fn unindex(&mut self, definition: &AgentDefinition) {
        drop_from(&mut self.by_type, &definition.agent_type.to_lowercase(), &definition.id);
        for tag in &definition.tags {
            drop_from(&mut self.by_tag, &tag.to_lowercase(), &definition.id);
        }
    }

    fn ordered(&self, ids: impl IntoIterator<Item = String>) -> Vec<Arc<AgentDefinition>> {
        let mut found: Vec<&CatalogEntry> = ids
            .into_iter()
            .filter_map(|id| self.agents.get(&id))
            .collect();
        found.sort_by_key(|e| e.seq);
        found.dedup_by_key(|e| e.seq);
        found.into_iter().map(|e| e.definition.clone()).collect()
    }
}

fn drop_from(index: &mut HashMap<String, BTreeSet<String>>, bucket: &str, id: &str) {
    if let Some(set) = index.get_mut(bucket) {
        set.remove(id);
        if set.is_empty() {
            index.remove(bucket);
        }
    }
}

/// Authoritative catalog of agent definitions and their aggregated metrics.
///
/// Catalog and indexes change together under one write lock. Metrics are
/// owned here and refreshed by [`refresh_metrics_once`](Self::refresh_metrics_once);
/// callers only report execution outcomes.
pub struct AgentRegistry {
    config: RegistryConfig,
    catalog: RwLock<Catalog>,
    capabilities: Arc<CapabilityRegistry>,
    runtime: Arc<AgentRuntime>,
    load: SnapshotMap<String, LoadMetrics>,
    performance: SnapshotMap<String, PerformanceMetrics>,
    health: SnapshotMap<String, HealthStatus>,
    ledger: SnapshotMap<String, ExecutionLedger>,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(
        config: RegistryConfig,
        capabilities: Arc<CapabilityRegistry>,
        runtime: Arc<AgentRuntime>,
    ) -> Self {
        Self {
            config,
            catalog: RwLock::new(Catalog::default()),
            capabilities,
            runtime,
            load: SnapshotMap::new(),
            performance: SnapshotMap::new(),
            health: SnapshotMap::new(),
            ledger: SnapshotMap::new(),
            events: EventBus::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Builder: publish agent events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Builder: emit counters and gauges to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The capability registry this registry resolves through.
    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// The runtime this registry reads instance state from.
    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    // --- catalog ---------------------------------------------------------

    /// Register or replace a definition, keyed by id.
    pub fn register(&self, definition: AgentDefinition) -> SwitchyardResult<()> {
        definition.validate()?;
        let id = definition.id.clone();
        let replaced = {
            let mut catalog = self.catalog.write();
            let previous = catalog.agents.remove(&id);
            if let Some(prev) = &previous {
                catalog.unindex(&prev.definition);
            }
            let seq = match &previous {
                Some(prev) => prev.seq,
                None => {
                    catalog.next_seq += 1;
                    catalog.next_seq
                }
            };
            catalog.index(&definition);
            catalog.agents.insert(
                id.clone(),
                CatalogEntry {
                    definition: Arc::new(definition),
                    seq,
                    registered_at: Utc::now(),
                },
            );
            previous.is_some()
        };

        info!(agent_id = %id, replaced, "agent registered");
        self.metrics.increment("agent.registered", &[("agent_id", id.as_str())]);
        self.events
            .publish(OrchestrationEvent::AgentRegistered { agent_id: id });
        Ok(())
    }

    /// Register a definition together with its capabilities.
    pub async fn register_with_capabilities(
        &self,
        definition: AgentDefinition,
        capabilities: Vec<CapabilityDescriptor>,
    ) -> SwitchyardResult<()> {
        let agent_id = definition.id.clone();
        self.register(definition)?;
        for capability in capabilities {
            self.capabilities
                .register_capability(capability, &agent_id, None, None)
                .await?;
        }
        Ok(())
    }

    /// Remove a definition, its capability entries and its metrics.
    ///
    /// Returns `false` (and does nothing) when the id is not registered.
    pub fn unregister(&self, agent_id: &str) -> SwitchyardResult<bool> {
        let removed = {
            let mut catalog = self.catalog.write();
            let removed = catalog.agents.remove(agent_id);
            if let Some(entry) = &removed {
                catalog.unindex(&entry.definition);
            }
            removed
        };
        if removed.is_none() {
            debug!(agent_id = %agent_id, "unregister of unknown agent ignored");
            return Ok(false);
        }

        let capabilities = self.capabilities.unregister_agent_capabilities(agent_id);
        let key = agent_id.to_string();
        self.load.remove(&key);
        self.performance.remove(&key);
        self.health.remove(&key);
        self.ledger.remove(&key);

        info!(agent_id = %agent_id, capabilities, "agent unregistered");
        self.metrics
            .increment("agent.unregistered", &[("agent_id", agent_id)]);
        self.events.publish(OrchestrationEvent::AgentUnregistered {
            agent_id: key,
        });
        Ok(true)
    }

    /// One definition.
    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentDefinition>> {
        self.catalog
            .read()
            .agents
            .get(agent_id)
            .map(|e| e.definition.clone())
    }

    /// When an agent was (last) registered.
    pub fn registered_at(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.catalog.read().agents.get(agent_id).map(|e| e.registered_at)
    }

    /// Every definition, in registration order.
    pub fn list_all(&self) -> Vec<Arc<AgentDefinition>> {
        let catalog = self.catalog.read();
        catalog.ordered(catalog.agents.keys().cloned().collect::<Vec<_>>())
    }

    /// Number of registered agents.
    pub fn count(&self) -> usize {
        self.catalog.read().agents.len()
    }

    /// Registered agent types.
    pub fn agent_types(&self) -> Vec<String> {
        self.catalog.read().by_type.keys().cloned().collect()
    }

    /// Agents indexed under `task_type`, united with agents offering a
    /// capability in that category; registration order.
    pub fn find_agents_for_task_type(&self, task_type: &str) -> Vec<Arc<AgentDefinition>> {
        let by_category = self.capabilities.agents_with_category(task_type);
        let catalog = self.catalog.read();
        let by_type = catalog
            .by_type
            .get(&task_type.to_lowercase())
            .cloned()
            .unwrap_or_default();
        catalog.ordered(by_type.into_iter().chain(by_category))
    }

    /// Agents offering `capability_id`, optionally only through entries in `health`.
    pub fn find_agents_by_capability(
        &self,
        capability_id: &str,
        health: Option<HealthStatus>,
    ) -> Vec<Arc<AgentDefinition>> {
        let ids = self.capabilities.agents_with_capability(capability_id, health);
        self.catalog.read().ordered(ids)
    }

    /// Agents matching capability discovery filters.
    pub fn find_agents_by_query(&self, query: &CapabilityQuery) -> Vec<Arc<AgentDefinition>> {
        let ids: Vec<String> = self
            .capabilities
            .discover(query)
            .iter()
            .map(|e| e.agent_id.clone())
            .collect();
        self.catalog.read().ordered(ids)
    }

    /// Filtered listing; health first (queried live from the runtime), then
    /// type, then tag.
    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<Arc<AgentDefinition>> {
        let mut agents = self.list_all();

        if let Some(wanted) = filter.health {
            let mut kept = Vec::with_capacity(agents.len());
            for agent in agents {
                let healths = self.runtime.agent_instance_health(&agent.id).await;
                if healths.iter().any(|(_, h)| *h == wanted) {
                    kept.push(agent);
                }
            }
            agents = kept;
        }
        if let Some(agent_type) = &filter.agent_type {
            agents.retain(|a| a.agent_type.eq_ignore_ascii_case(agent_type));
        }
        if let Some(tag) = &filter.tag {
            agents.retain(|a| a.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)));
        }
        agents
    }

    /// Case-insensitive substring search scored name 50, description 30,
    /// type 25 and 10 per matching tag; best first, at most `limit`.
    pub fn search(&self, term: &str, limit: usize) -> Vec<SearchHit> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut hits: Vec<(u64, SearchHit)> = {
            let catalog = self.catalog.read();
            catalog
                .agents
                .values()
                .filter_map(|entry| {
                    let score = search_score(&entry.definition, &needle);
                    (score > 0).then(|| {
                        (
                            entry.seq,
                            SearchHit {
                                agent: entry.definition.clone(),
                                score,
                            },
                        )
                    })
                })
                .collect()
        };
        hits.sort_by(|(seq_a, a), (seq_b, b)| b.score.cmp(&a.score).then(seq_a.cmp(seq_b)));
        hits.into_iter().take(limit).map(|(_, hit)| hit).collect()
    }

    // --- execution ledger ------------------------------------------------

    /// Note that an attempt was dispatched to `agent_id`.
    pub fn begin_execution(&self, agent_id: &str) {
        self.adjust_ledger(agent_id, |l| l.in_flight = l.in_flight.saturating_add(1));
    }

    /// Record a settled attempt against `agent_id`.
    pub fn record_execution_outcome(&self, agent_id: &str, duration_ms: f64, success: bool) {
        self.adjust_ledger(agent_id, |l| {
            *l = l.record(duration_ms, success);
            l.in_flight = l.in_flight.saturating_sub(1);
        });
    }

    fn adjust_ledger(&self, agent_id: &str, f: impl FnOnce(&mut ExecutionLedger)) {
        // Held across the write so `unregister` cannot slip in between.
        let catalog = self.catalog.read();
        if !catalog.agents.contains_key(agent_id) {
            debug!(agent_id = %agent_id, "execution outcome for unregistered agent dropped");
            return;
        }
        let key = agent_id.to_string();
        // Insert-if-absent then update keeps concurrent first writers from clobbering each other.
        let _ = self.ledger.insert_if_absent(key.clone(), ExecutionLedger::default());
        let _ = self.ledger.update(&key, |current| {
            let mut next = current.clone();
            f(&mut next);
            Ok::<_, ()>(next)
        });
    }

    /// Raw execution ledger of an agent.
    pub fn ledger(&self, agent_id: &str) -> ExecutionLedger {
        self.ledger
            .get(&agent_id.to_string())
            .map(|l| (*l).clone())
            .unwrap_or_default()
    }

    // --- metrics ---------------------------------------------------------

    /// Latest load metrics (neutral if never measured).
    pub fn load_metrics(&self, agent_id: &str) -> LoadMetrics {
        self.load
            .get(&agent_id.to_string())
            .map(|m| (*m).clone())
            .unwrap_or_else(|| LoadMetrics::unmeasured(agent_id))
    }

    /// Latest performance metrics (neutral if never measured).
    pub fn performance_metrics(&self, agent_id: &str) -> PerformanceMetrics {
        self.performance
            .get(&agent_id.to_string())
            .map(|m| (*m).clone())
            .unwrap_or_else(|| PerformanceMetrics::unmeasured(agent_id))
    }

    /// Latest aggregated health.
    pub fn agent_health(&self, agent_id: &str) -> HealthStatus {
        self.health
            .get(&agent_id.to_string())
            .map(|h| *h)
            .unwrap_or_default()
    }

    /// Recompute one agent's load, performance and health.
    pub async fn refresh_agent(&self, agent_id: &str) -> SwitchyardResult<()> {
        let definition = self
            .get(agent_id)
            .ok_or_else(|| SwitchyardError::not_found("agent", agent_id))?;
        let instances = self.runtime.agent_instance_health(agent_id).await;
        let ledger = self.ledger(agent_id);

        let live: Vec<_> = instances
            .iter()
            .filter(|(i, h)| i.is_running() && h.is_usable())
            .collect();
        let active: u32 = live.iter().map(|(i, _)| i.active_invocations).sum();
        #[allow(clippy::cast_precision_loss)]
        let load_score = if live.is_empty() {
            100.0
        } else {
            live.iter()
                .map(|(i, _)| instance_load(i.resource_usage.cpu_percent, i.active_invocations))
                .sum::<f64>()
                / live.len() as f64
        };
        let load = LoadMetrics {
            agent_id: agent_id.to_string(),
            load_score,
            active_tasks: active,
            queued_tasks: ledger.in_flight.saturating_sub(active),
            average_response_ms: ledger.average_duration_ms,
            available: !live.is_empty() && load_score < 100.0,
            live_instances: live.len(),
            updated_at: Utc::now(),
        };

        let healthy = instances
            .iter()
            .filter(|(_, h)| *h == HealthStatus::Healthy)
            .count();
        #[allow(clippy::cast_precision_loss)]
        let healthy_ratio = if instances.is_empty() {
            0.0
        } else {
            healthy as f64 / instances.len() as f64
        };
        let success_rate = ledger.success_rate();
        #[allow(clippy::cast_precision_loss)]
        let timeout_ms = definition.resources.timeout_secs as f64 * 1000.0;
        let performance = PerformanceMetrics {
            agent_id: agent_id.to_string(),
            success_rate,
            reliability_score: reliability_score(success_rate, healthy_ratio),
            performance_score: performance_score(
                success_rate,
                ledger.average_duration_ms,
                timeout_ms,
            ),
            total_executions: ledger.total,
            updated_at: Utc::now(),
        };

        let current = HealthStatus::best(instances.iter().map(|(_, h)| *h));
        let previous = {
            let catalog = self.catalog.read();
            if !catalog.agents.contains_key(agent_id) {
                debug!(agent_id = %agent_id, "agent unregistered during refresh");
                return Ok(());
            }
            self.load.insert(agent_id.to_string(), load);
            self.performance.insert(agent_id.to_string(), performance);
            self.health
                .insert(agent_id.to_string(), current)
                .map(|h| *h)
                .unwrap_or_default()
        };
        self.metrics
            .gauge("agent.load_score", load_score, &[("agent_id", agent_id)]);
        if previous != current {
            info!(agent_id = %agent_id, %previous, %current, "agent health changed");
            self.events.publish(OrchestrationEvent::AgentHealthChanged {
                agent_id: agent_id.to_string(),
                previous,
                current,
            });
        }
        Ok(())
    }

    /// Refresh every agent; per-agent failures are logged and skipped.
    pub async fn refresh_metrics_once(&self) -> usize {
        let mut refreshed = 0;
        for agent in self.list_all() {
            match self.refresh_agent(&agent.id).await {
                Ok(()) => refreshed += 1,
                Err(e) => warn!(agent_id = %agent.id, error = %e, "agent metrics refresh failed"),
            }
        }
        debug!(refreshed, "agent metrics refresh complete");
        refreshed
    }

    /// Run the metrics refresh on the configured schedule until cancelled.
    pub fn spawn_metrics_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let (delay, interval) = (self.config.initial_delay(), self.config.interval());
        tokio::spawn(async move {
            run_periodic(cancel, delay, interval, || {
                let registry = registry.clone();
                async move {
                    registry.refresh_metrics_once().await;
                }
            })
            .await;
        })
    }

    /// Follow a loader's notifications: register on load, unregister on unload.
    pub fn attach_loader(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<LoaderEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(LoaderEvent::Loaded {
                        definition,
                        capabilities,
                    }) => {
                        let agent_id = definition.id.clone();
                        if let Err(e) = registry
                            .register_with_capabilities(definition, capabilities)
                            .await
                        {
                            warn!(agent_id = %agent_id, error = %e, "auto-registration failed");
                        }
                    }
                    Ok(LoaderEvent::Unloaded { agent_id }) => {
                        if let Err(e) = registry.unregister(&agent_id) {
                            warn!(agent_id = %agent_id, error = %e, "auto-unregistration failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "loader notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("loader subscription ended");
        })
    }
}

fn search_score(definition: &AgentDefinition, needle: &str) -> u32 {
    let mut score = 0;
    if definition.name.to_lowercase().contains(needle) {
        score += 50;
    }
    if definition.description.to_lowercase().contains(needle) {
        score += 30;
    }
    if definition.agent_type.to_lowercase().contains(needle) {
        score += 25;
    }
    let tags = definition
        .tags
        .iter()
        .filter(|t| t.to_lowercase().contains(needle))
        .count();
    score + 10 * u32::try_from(tags).unwrap_or(u32::MAX / 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_score_fields() {
        let def = AgentDefinition::new("a", "Text Summarizer", "analysis")
            .with_description("Summarizes long text")
            .with_tags(["text", "nlp", "context"]);
        // name 50 + description 30 + two tags containing "text" 20
        assert_eq!(search_score(&def, "text"), 100);
        assert_eq!(search_score(&def, "analysis"), 25);
        assert_eq!(search_score(&def, "vision"), 0);
    }

    #[test]
    fn test_catalog_unindex_drops_empty_buckets() {
        let mut catalog = Catalog::default();
        let def = AgentDefinition::new("a", "A", "analysis").with_tags(["x"]);
        catalog.index(&def);
        catalog.unindex(&def);
        assert!(catalog.by_type.is_empty());
        assert!(catalog.by_tag.is_empty());
    }
}
