use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use switchyard_core::{ErrorInfo, SwitchyardError, SwitchyardResult};
use uuid::Uuid;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Known but neither queued nor running.
    #[default]
    Pending,
    /// Waiting for the scheduler.
    Queued,
    /// An attempt is in progress.
    Running,
    /// Held at the next attempt boundary until resumed.
    Paused,
    /// Backing off before the next attempt.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl TaskStatus {
    /// `Completed`, `Failed` and `Cancelled` are never left except by an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the executor may move a task from `self` to `to`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Queued | Running | Cancelled)
                | (Queued, Running | Failed | Cancelled)
                | (Running, Completed | Failed | Cancelled | Paused | Retrying)
                | (Paused, Running | Cancelled)
                | (Retrying, Running | Failed | Cancelled)
        )
    }

    /// Every status, in lifecycle order.
    pub fn all() -> [TaskStatus; 8] {
        use TaskStatus::*;
        [Pending, Queued, Running, Paused, Retrying, Completed, Failed, Cancelled]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome recorded on a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the final attempt succeeded.
    pub success: bool,
    /// Output of the successful attempt.
    pub output: Option<Value>,
    /// Attempts made.
    pub attempts: u32,
    /// Wall-clock time across all attempts.
    pub duration_ms: u64,
    /// Agent of the last attempt.
    pub agent_id: Option<String>,
    /// Instance of the last attempt.
    pub instance_id: Option<String>,
    /// One line per attempt plus a summary.
    pub logs: Vec<String>,
}

fn default_priority() -> u8 {
    5
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

/// A unit of work routed to an agent by its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique task id.
    #[serde(default = "new_task_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Routing key, matched against agent types, tags, capabilities and capability categories.
    pub task_type: String,
    /// Opaque input payload.
    #[serde(default)]
    pub input: Value,
    /// Opaque per-task configuration.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// 0 (lowest) to 10 (highest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Deadline per attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retries used so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Agent of the current or last attempt.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Instance of the current or last attempt.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Percent complete.
    #[serde(default)]
    pub progress: u8,
    /// Latest progress note.
    #[serde(default)]
    pub progress_message: Option<String>,
    /// Tasks that must be `Completed` before the scheduler runs this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Earliest time the scheduler may run this task.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last time the task entered the queue.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    /// Last time an execution began.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome, once finished.
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Terminal failure, if any.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

impl AgentTask {
    /// A pending task with default priority, timeout and retry budget.
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, input: Value) -> Self {
        Self {
            id: new_task_id(),
            name: name.into(),
            task_type: task_type.into(),
            input,
            config: HashMap::new(),
            priority: default_priority(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_count: 0,
            status: TaskStatus::Pending,
            agent_id: None,
            instance_id: None,
            progress: 0,
            progress_message: None,
            dependencies: Vec::new(),
            scheduled_for: None,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Builder: set the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder: set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the per-attempt timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Builder: set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: set dependencies.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: defer until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Builder: set configuration.
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Attempts allowed in one execution.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `scheduled_for` has passed (or is unset).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }

    /// Reject tasks with missing or out-of-range fields.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.id.trim().is_empty() {
            return Err(SwitchyardError::Validation("task id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' has no name",
                self.id
            )));
        }
        if self.task_type.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' has no type",
                self.id
            )));
        }
        if self.priority > 10 {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' priority {} is outside 0..=10",
                self.id, self.priority
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' has a zero timeout",
                self.id
            )));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(SwitchyardError::Validation(format!(
                "task '{}' depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Tasks known to the executor.
    pub total: usize,
    /// Count per status; statuses with no tasks are omitted.
    pub by_status: std::collections::BTreeMap<TaskStatus, usize>,
}

impl TaskSummary {
    /// Count for one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in TaskStatus::all().into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::all() {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_pause_only_from_running() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::Retrying.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_validate() {
        let task = AgentTask::new("t", "analysis", Value::Null);
        assert!(task.validate().is_ok());
        assert!(task.clone().with_priority(11).validate().is_err());
        assert!(task.clone().with_timeout_ms(0).validate().is_err());
        let id = task.id.clone();
        assert!(task.with_dependencies([id]).validate().is_err());
        assert!(AgentTask::new("t", " ", Value::Null).validate().is_err());
    }

    #[test]
    fn test_task_from_toml_defaults() {
        let task: AgentTask = toml::from_str(
            r#"
name = "summarize report"
task_type = "analysis"
"#,
        )
        .unwrap();
        assert!(!task.id.is_empty());
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_attempts(), 4);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.is_due(Utc::now()));
    }
}
