use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use switchyard_core::ErrorInfo;

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created or cleanly stopped; no process.
    Stopped,
    /// Process launch in progress.
    Starting,
    /// Process alive and accepting work.
    Running,
    /// Process suspended.
    Paused,
    /// Shutdown in progress.
    Stopping,
    /// Unrecoverable error; see the instance's `last_error`.
    Failed,
}

impl InstanceStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Any state may move to `Failed`. A paused instance must be resumed
    /// before it can be stopped.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Running, Paused)
                | (Paused, Running)
                | (Failed, Stopping)
                | (Starting, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether a process is expected to exist in this state.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting
                | InstanceStatus::Running
                | InstanceStatus::Paused
                | InstanceStatus::Stopping
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Paused => write!(f, "paused"),
            InstanceStatus::Stopping => write!(f, "stopping"),
            InstanceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time resource sample for an instance's process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// When the sample was taken.
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Per-instance overrides supplied at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Extra environment, layered over the definition's.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Extra arguments appended to the definition's.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Pin the instance to this working directory instead of allocating one.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// A running (or stopped) process of an agent definition.
///
/// Only the runtime mutates instances; everyone else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Instance identifier.
    pub id: String,
    /// Owning agent definition.
    pub agent_id: String,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// Allocated working directory.
    pub working_dir: PathBuf,
    /// Environment the process is launched with.
    pub environment: HashMap<String, String>,
    /// Arguments the process is launched with.
    pub args: Vec<String>,
    /// OS process id while a process exists.
    pub pid: Option<u32>,
    /// Latest resource sample.
    pub resource_usage: ResourceUsage,
    /// Owning user or tenant.
    pub owner: String,
    /// Invocations currently in flight.
    pub active_invocations: u32,
    /// Invocations dispatched over the instance's lifetime.
    pub total_invocations: u64,
    /// Error that moved the instance to `Failed`.
    pub last_error: Option<ErrorInfo>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful start.
    pub started_at: Option<DateTime<Utc>>,
    /// Last stop.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    /// Whether the instance can accept work.
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}
