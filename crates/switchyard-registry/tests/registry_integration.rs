//! Catalog, discovery and metrics scenarios over a simulated runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    AgentDefinition, CapabilityDescriptor, EventBus, HealthStatus, InMemoryMetrics,
    OrchestrationEvent,
};
use switchyard_registry::*;
use switchyard_runtime::{AgentRuntime, EchoEndpoint, RuntimeConfig, SimulatedProcessControl};
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: tempfile::TempDir,
    runtime: Arc<AgentRuntime>,
    control: Arc<SimulatedProcessControl>,
    capabilities: Arc<CapabilityRegistry>,
    agents: Arc<AgentRegistry>,
    metrics: Arc<InMemoryMetrics>,
    events: EventBus,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let events = EventBus::default();
    let metrics = Arc::new(InMemoryMetrics::new());
    let control = Arc::new(SimulatedProcessControl::new());
    let runtime = Arc::new(
        AgentRuntime::new(
            RuntimeConfig::default().with_work_root(dir.path()),
            control.clone(),
            Arc::new(EchoEndpoint),
        )
        .with_events(events.clone())
        .with_metrics(metrics.clone()),
    );
    let capabilities = Arc::new(
        CapabilityRegistry::new(CapabilityConfig::default(), runtime.clone())
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
    );
    let agents = Arc::new(
        AgentRegistry::new(RegistryConfig::default(), capabilities.clone(), runtime.clone())
            .with_events(events.clone())
            .with_metrics(metrics.clone()),
    );
    Fixture {
        _dir: dir,
        runtime,
        control,
        capabilities,
        agents,
        metrics,
        events,
    }
}

async fn start_instance(f: &Fixture, definition: &AgentDefinition) -> String {
    let id = f
        .runtime
        .create_instance(definition, None, "tenant-a")
        .await
        .unwrap()
        .id;
    f.runtime.start_instance(&id).await.unwrap();
    id
}

fn vision_cap(id: &str) -> CapabilityDescriptor {
    CapabilityDescriptor::new(id, id, "vision").with_tags(["camera"])
}

#[tokio::test]
async fn test_discover_vision_capabilities_that_are_available() {
    let f = fixture();
    let a = AgentDefinition::new("cam-a", "Camera A", "vision").with_capabilities(["vision.observe"]);
    let b = AgentDefinition::new("cam-b", "Camera B", "vision").with_capabilities(["vision.observe"]);
    let c = AgentDefinition::new("text", "Text", "analysis").with_capabilities(["text.summarize"]);
    f.agents
        .register_with_capabilities(a, vec![vision_cap("vision.observe")])
        .await
        .unwrap();
    f.agents
        .register_with_capabilities(b, vec![vision_cap("vision.observe")])
        .await
        .unwrap();
    f.agents
        .register_with_capabilities(
            c,
            vec![CapabilityDescriptor::new("text.summarize", "Summarize", "analysis")],
        )
        .await
        .unwrap();
    f.capabilities
        .set_available("cam-b", "vision.observe", false)
        .unwrap();

    let found = f
        .capabilities
        .discover(&CapabilityQuery::new().category("vision").available(true));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].agent_id, "cam-a");

    let agents = f
        .agents
        .find_agents_by_query(&CapabilityQuery::new().category("vision"));
    let ids: Vec<_> = agents.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, ["cam-a", "cam-b"]);
}

#[tokio::test]
async fn test_register_then_unregister_leaves_no_trace() {
    let f = fixture();
    let mut rx = f.events.subscribe();
    let def = AgentDefinition::new("ocr", "OCR", "vision")
        .with_tags(["Images"])
        .with_capabilities(["extract-text"]);
    f.agents
        .register_with_capabilities(def, vec![vision_cap("extract-text")])
        .await
        .unwrap();
    f.agents.record_execution_outcome("ocr", 20.0, true);

    assert_eq!(f.agents.find_agents_for_task_type("vision").len(), 1);
    assert!(f.agents.unregister("ocr").unwrap());

    assert!(f.agents.get("ocr").is_none());
    assert!(f.agents.find_agents_for_task_type("vision").is_empty());
    assert!(f.agents.list_agents(&AgentFilter {
        tag: Some("images".into()),
        ..Default::default()
    })
    .await
    .is_empty());
    assert!(f.capabilities.capabilities_for_agent("ocr").is_empty());
    assert_eq!(f.agents.ledger("ocr").total, 0);
    assert!(!f.agents.unregister("ocr").unwrap());

    assert_eq!(f.metrics.counter("agent.registered"), 1);
    assert_eq!(f.metrics.counter("agent.unregistered"), 1);
    let mut unregistered = false;
    while let Ok(envelope) = rx.try_recv() {
        if let OrchestrationEvent::AgentUnregistered { agent_id } = envelope.event {
            unregistered = agent_id == "ocr";
        }
    }
    assert!(unregistered);
}

#[tokio::test]
async fn test_unregister_during_refresh_leaves_no_metrics() {
    let f = fixture();
    let def = AgentDefinition::new("worker", "Worker", "general");
    f.agents.register(def.clone()).unwrap();
    start_instance(&f, &def).await;

    // The refresh is parked on the process query when the agent goes away.
    f.control.set_state_delay(Duration::from_millis(50));
    let refresh = tokio::spawn({
        let agents = f.agents.clone();
        async move { agents.refresh_agent("worker").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.agents.unregister("worker").unwrap());
    refresh.await.unwrap().unwrap();

    let load = f.agents.load_metrics("worker");
    assert_eq!(load.live_instances, 0);
    assert_eq!(load.load_score, 0.0);
    assert_eq!(f.agents.agent_health("worker"), HealthStatus::default());
    assert_eq!(f.metrics.gauge_value("agent.load_score"), None);

    // Late outcomes are dropped rather than reviving the ledger.
    f.agents.begin_execution("worker");
    f.agents.record_execution_outcome("worker", 100.0, true);
    assert_eq!(f.agents.ledger("worker").total, 0);
    assert_eq!(f.agents.ledger("worker").in_flight, 0);
}

#[tokio::test]
async fn test_task_type_lookup_unites_types_and_capability_categories() {
    let f = fixture();
    f.agents
        .register(AgentDefinition::new("typed", "Typed", "vision"))
        .unwrap();
    let general = AgentDefinition::new("general", "General", "general")
        .with_capabilities(["vision.observe"]);
    f.agents
        .register_with_capabilities(general, vec![vision_cap("vision.observe")])
        .await
        .unwrap();

    let ids: Vec<_> = f
        .agents
        .find_agents_for_task_type("Vision")
        .iter()
        .map(|a| a.id.clone())
        .collect();
    assert_eq!(ids, ["typed", "general"]);
}

#[tokio::test]
async fn test_search_ranks_by_field_weight() {
    let f = fixture();
    f.agents
        .register(
            AgentDefinition::new("t1", "Translator", "language").with_description("Handles text"),
        )
        .unwrap();
    f.agents
        .register(AgentDefinition::new("t2", "Text Summarizer", "analysis").with_tags(["text"]))
        .unwrap();

    let hits = f.agents.search("text", 10);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].agent.id, "t2");
    assert_eq!(hits[0].score, 60);
    assert_eq!(hits[1].score, 30);
    assert_eq!(f.agents.search("text", 1).len(), 1);
    assert!(f.agents.search("   ", 10).is_empty());
}

#[tokio::test]
async fn test_health_filter_reads_runtime_state() {
    let f = fixture();
    let up = AgentDefinition::new("up", "Up", "vision");
    let down = AgentDefinition::new("down", "Down", "vision");
    f.agents.register(up.clone()).unwrap();
    f.agents.register(down.clone()).unwrap();
    start_instance(&f, &up).await;
    f.runtime.create_instance(&down, None, "tenant-a").await.unwrap();

    let healthy = f
        .agents
        .list_agents(&AgentFilter {
            health: Some(HealthStatus::Healthy),
            agent_type: Some("VISION".into()),
            tag: None,
        })
        .await;
    let ids: Vec<_> = healthy.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, ["up"]);
}

#[tokio::test]
async fn test_metrics_refresh_aggregates_instances_and_outcomes() {
    let f = fixture();
    let def = AgentDefinition::new("worker", "Worker", "batch");
    f.agents.register(def.clone()).unwrap();

    let unmeasured = f.agents.load_metrics("worker");
    assert!(unmeasured.available);
    assert_eq!(unmeasured.load_score, 0.0);

    // No live instance yet: saturated and unavailable.
    f.agents.refresh_agent("worker").await.unwrap();
    let load = f.agents.load_metrics("worker");
    assert_eq!(load.load_score, 100.0);
    assert!(!load.available);

    let iid = start_instance(&f, &def).await;
    let pid = f.runtime.get_instance(&iid).unwrap().pid.unwrap();
    f.control.set_usage(pid, 40.0, 1024);
    f.runtime.monitor_once().await;

    f.agents.begin_execution("worker");
    f.agents.record_execution_outcome("worker", 100.0, true);
    f.agents.begin_execution("worker");
    f.agents.record_execution_outcome("worker", 300.0, false);

    assert_eq!(f.agents.refresh_metrics_once().await, 1);
    let load = f.agents.load_metrics("worker");
    assert_eq!(load.live_instances, 1);
    assert_eq!(load.load_score, 20.0);
    assert!(load.available);
    assert_eq!(load.average_response_ms, 200.0);

    let perf = f.agents.performance_metrics("worker");
    assert_eq!(perf.success_rate, 50.0);
    assert_eq!(perf.total_executions, 2);
    assert!((perf.reliability_score - 65.0).abs() < 1e-9);
    assert_eq!(f.agents.agent_health("worker"), HealthStatus::Healthy);
    assert_eq!(f.metrics.gauge_value("agent.load_score"), Some(20.0));
}

#[tokio::test]
async fn test_capability_execution_records_usage() {
    let f = fixture();
    let def = AgentDefinition::new("cam", "Camera", "vision").with_capabilities(["vision.observe"]);
    f.agents
        .register_with_capabilities(def.clone(), vec![vision_cap("vision.observe")])
        .await
        .unwrap();
    start_instance(&f, &def).await;

    let response = f
        .capabilities
        .execute(
            CapabilityRequest::new("vision.observe", json!({"frame": 1}))
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(response.agent_id, "cam");
    assert_eq!(response.output["input"]["frame"], 1);

    let err = f
        .capabilities
        .execute(CapabilityRequest::new(
            "vision.observe",
            json!({"simulate_error": "lens cap on"}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("lens cap on"));

    let entry = f.capabilities.get("cam", "vision.observe").unwrap();
    assert_eq!(entry.usage.total_executions, 2);
    assert_eq!(f.metrics.counter("capability.executed"), 1);
    assert_eq!(f.metrics.counter("capability.failed"), 1);
}

#[tokio::test]
async fn test_loader_events_register_and_unregister_agents() {
    let f = fixture();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("ocr.toml"),
        r#"
[agent]
id = "ocr"
name = "OCR"
agent_type = "vision"
capabilities = ["extract-text"]

[[capabilities]]
id = "extract-text"
name = "Extract text"
category = "vision"
"#,
    )
    .unwrap();

    let loader = ManifestLoader::new(dir.path());
    let cancel = CancellationToken::new();
    let handle = f.agents.attach_loader(loader.subscribe(), cancel.clone());

    loader.load_all().await.unwrap();
    for _ in 0..50 {
        if f.agents.get("ocr").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(f.agents.get("ocr").is_some());
    assert!(f.capabilities.get("ocr", "extract-text").is_some());

    assert!(loader.unload("ocr").await);
    for _ in 0..50 {
        if f.agents.get("ocr").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(f.agents.get("ocr").is_none());
    assert!(f.capabilities.get("ocr", "extract-text").is_none());

    cancel.cancel();
    handle.await.unwrap();
}
