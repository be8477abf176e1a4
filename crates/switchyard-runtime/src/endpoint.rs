use crate::instance::AgentInstance;
use crate::process::LocalProcessControl;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{AgentDefinition, SwitchyardError, SwitchyardResult};

/// One unit of work dispatched to an agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// Operation name: the task type, or `capability` for capability calls.
    pub operation: String,
    /// Capability being invoked, if any.
    pub capability_id: Option<String>,
    /// Opaque input payload.
    pub input: Value,
    /// Opaque per-call configuration.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Deadline for the call.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Invocation {
    /// A task-type invocation.
    pub fn task(operation: impl Into<String>, input: Value, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            capability_id: None,
            input,
            config: HashMap::new(),
            timeout,
        }
    }

    /// A capability invocation.
    pub fn capability(capability_id: impl Into<String>, input: Value, timeout: Duration) -> Self {
        Self {
            operation: "capability".into(),
            capability_id: Some(capability_id.into()),
            input,
            config: HashMap::new(),
            timeout,
        }
    }

    /// Builder: attach configuration.
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Transport used to hand an invocation to a running instance.
///
/// The runtime owns lifecycle and accounting; endpoints only move payloads.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Deliver `invocation` to `instance` and return its output.
    async fn invoke(
        &self,
        instance: &AgentInstance,
        definition: &AgentDefinition,
        invocation: &Invocation,
    ) -> SwitchyardResult<Value>;
}

/// Talks to agent processes over their stdio request channel.
pub struct ProcessEndpoint {
    control: Arc<LocalProcessControl>,
}

impl ProcessEndpoint {
    /// Create an endpoint over the channels of `control`'s children.
    pub fn new(control: Arc<LocalProcessControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl AgentEndpoint for ProcessEndpoint {
    async fn invoke(
        &self,
        instance: &AgentInstance,
        _definition: &AgentDefinition,
        invocation: &Invocation,
    ) -> SwitchyardResult<Value> {
        let pid = instance.pid.ok_or_else(|| {
            SwitchyardError::Execution(format!("instance {} unavailable: no process", instance.id))
        })?;
        let channel = self.control.channel(pid).ok_or_else(|| {
            SwitchyardError::Execution(format!(
                "instance {} unavailable: no connection to process {}",
                instance.id, pid
            ))
        })?;
        channel
            .request(serde_json::to_value(invocation)?, invocation.timeout)
            .await
    }
}

/// Answers every invocation in-process.
///
/// The output echoes the call. Inputs may steer the outcome for dry runs:
/// `"simulate_delay_ms"` sleeps first, `"simulate_error"` fails with that
/// message.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoEndpoint;

#[async_trait]
impl AgentEndpoint for EchoEndpoint {
    async fn invoke(
        &self,
        instance: &AgentInstance,
        definition: &AgentDefinition,
        invocation: &Invocation,
    ) -> SwitchyardResult<Value> {
        if let Some(ms) = invocation.input.get("simulate_delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = invocation.input.get("simulate_error").and_then(Value::as_str) {
            return Err(SwitchyardError::Execution(message.to_string()));
        }
        Ok(serde_json::json!({
            "agent_id": definition.id,
            "instance_id": instance.id,
            "operation": invocation.operation,
            "capability_id": invocation.capability_id,
            "input": invocation.input,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::instance::{InstanceStatus, ResourceUsage};
    use chrono::Utc;
    use std::path::PathBuf;

    fn instance() -> AgentInstance {
        AgentInstance {
            id: "i-1".into(),
            agent_id: "a-1".into(),
            status: InstanceStatus::Running,
            working_dir: PathBuf::from("/tmp"),
            environment: HashMap::new(),
            args: Vec::new(),
            pid: Some(1),
            resource_usage: ResourceUsage::default(),
            owner: "tester".into(),
            active_invocations: 0,
            total_invocations: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_call() {
        let def = AgentDefinition::new("a-1", "Agent", "analysis");
        let call = Invocation::capability(
            "summarize",
            serde_json::json!({"text": "hi"}),
            Duration::from_secs(1),
        );
        let out = EchoEndpoint.invoke(&instance(), &def, &call).await.unwrap();
        assert_eq!(out["capability_id"], "summarize");
        assert_eq!(out["input"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_echo_simulated_error() {
        let def = AgentDefinition::new("a-1", "Agent", "analysis");
        let call = Invocation::task(
            "analysis",
            serde_json::json!({"simulate_error": "connection reset"}),
            Duration::from_secs(1),
        );
        let err = EchoEndpoint.invoke(&instance(), &def, &call).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_process_endpoint_without_channel() {
        let endpoint = ProcessEndpoint::new(Arc::new(LocalProcessControl::new()));
        let def = AgentDefinition::new("a-1", "Agent", "analysis");
        let call = Invocation::task("analysis", Value::Null, Duration::from_secs(1));
        let err = endpoint.invoke(&instance(), &def, &call).await.unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn test_invocation_serializes_timeout_as_ms() {
        let call = Invocation::task("x", Value::Null, Duration::from_millis(1500));
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["timeout"], 1500);
    }
}
