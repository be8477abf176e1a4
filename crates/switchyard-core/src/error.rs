use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable error codes attached to tasks and instances.
pub mod codes {
    /// A request failed field validation before any state was touched.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    /// An unknown task, agent, instance or capability id.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The requested lifecycle transition is not legal from the current state.
    pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
    /// Generic execution failure.
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    /// An operation exceeded its deadline.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// An operation was cancelled by its caller.
    pub const CANCELLED: &str = "CANCELLED";
    /// The process layer reported a failure.
    pub const PROCESS_ERROR: &str = "PROCESS_ERROR";
    /// The router could not produce a decision.
    pub const ROUTING_FAILED: &str = "ROUTING_FAILED";
    /// A capability could not be resolved or dispatched.
    pub const CAPABILITY_ERROR: &str = "CAPABILITY_ERROR";
    /// Configuration could not be loaded or parsed.
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    /// Serialization of a payload failed.
    pub const SERIALIZATION_ERROR: &str = "SERIALIZATION_ERROR";
    /// An I/O operation failed.
    pub const IO_ERROR: &str = "IO_ERROR";

    /// An instance process could not be launched.
    pub const START_FAILED: &str = "START_FAILED";
    /// An instance process could not be terminated.
    pub const STOP_FAILED: &str = "STOP_FAILED";
    /// An instance process exited without an explicit stop.
    pub const PROCESS_EXITED: &str = "PROCESS_EXITED";
    /// No registered agent handles the task type.
    pub const NO_SUITABLE_AGENTS: &str = "NO_SUITABLE_AGENTS";
    /// The selected agent has no usable running instance.
    pub const NO_AVAILABLE_INSTANCES: &str = "NO_AVAILABLE_INSTANCES";
    /// The target instance failed its pre-execution health check.
    pub const AGENT_UNHEALTHY: &str = "AGENT_UNHEALTHY";
    /// A task dependency finished without completing.
    pub const DEPENDENCY_FAILED: &str = "DEPENDENCY_FAILED";
    /// Every permitted attempt failed.
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
}

/// Top-level error type for the Switchyard engine.
///
/// Variants follow the error taxonomy: validation and not-found errors are
/// raised before any mutation, state conflicts leave state untouched, and
/// execution-class errors feed the executor's retry decision.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    /// A missing or malformed field in a task, agent or request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An unknown identifier.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of record was looked up ("task", "agent", ...).
        kind: &'static str,
        /// The identifier that could not be resolved.
        id: String,
    },

    /// A lifecycle transition that is not legal from the current state.
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// A failure reported while executing work on an agent.
    #[error("Execution error: {0}")]
    Execution(String),

    /// An operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A failure from the process/OS layer.
    #[error("Process error: {0}")]
    Process(String),

    /// A routing decision could not be produced.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A capability could not be resolved or dispatched.
    #[error("Capability error: {0}")]
    Capability(String),

    /// Configuration loading or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

impl SwitchyardError {
    /// Shorthand for [`SwitchyardError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// The stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => codes::VALIDATION_ERROR,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::InvalidTransition(_) => codes::INVALID_TRANSITION,
            Self::Execution(_) => codes::EXECUTION_FAILED,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::Cancelled(_) => codes::CANCELLED,
            Self::Process(_) => codes::PROCESS_ERROR,
            Self::Routing(_) => codes::ROUTING_FAILED,
            Self::Capability(_) => codes::CAPABILITY_ERROR,
            Self::Config(_) | Self::Toml(_) => codes::CONFIG_ERROR,
            Self::Json(_) => codes::SERIALIZATION_ERROR,
            Self::Io(_) => codes::IO_ERROR,
        }
    }

    /// Default severity of this error class.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Cancelled(_) => Severity::Info,
            Self::Validation(_) | Self::NotFound { .. } | Self::InvalidTransition(_) => {
                Severity::Warning
            }
            Self::Process(_) => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// Convert into the structured form attached to tasks and instances.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string(), self.severity())
    }

    /// Convert into structured form under an explicit lifecycle code.
    pub fn to_info_with_code(&self, code: &str) -> ErrorInfo {
        ErrorInfo::new(code, self.to_string(), self.severity())
    }
}

/// How serious a recorded error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational; no corrective action needed.
    Info,
    /// Rejected request or degraded condition.
    Warning,
    /// A failed operation.
    Error,
    /// A failure that took a component out of service.
    Critical,
}

/// Structured error record attached to a task or instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code, see [`codes`].
    pub code: String,
    /// Human-readable message; the originating message is preserved verbatim.
    pub message: String,
    /// Severity of the failure.
    pub severity: Severity,
    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    /// Build a new error record stamped with the current time.
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            occurred_at: Utc::now(),
        }
    }
}

impl From<&SwitchyardError> for ErrorInfo {
    fn from(err: &SwitchyardError) -> Self {
        err.to_info()
    }
}
