use crate::{SwitchyardError, SwitchyardResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimum resources an agent needs, plus its default execution timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Minimum CPU cores.
    #[serde(default)]
    pub min_cpu_cores: f64,
    /// Minimum resident memory in megabytes.
    #[serde(default)]
    pub min_memory_mb: u64,
    /// Default execution timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            min_cpu_cores: 0.0,
            min_memory_mb: 0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// How much the host trusts an agent package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Unsigned or unknown origin.
    #[default]
    Untrusted,
    /// Signed by a known publisher.
    Verified,
    /// Shipped with the host.
    System,
}

/// Security requirements declared by an agent package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityRequirements {
    /// Minimum trust level the package was validated at.
    #[serde(default)]
    pub trust_level: TrustLevel,
    /// Permissions the agent needs from its host.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Whether the loader must have verified a signature.
    #[serde(default)]
    pub require_signature: bool,
}

/// Static description of an agent kind.
///
/// Produced by the loader, owned by the agent registry, and replaced wholesale
/// on re-registration under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description, used by search.
    #[serde(default)]
    pub description: String,
    /// Package version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Type tag; task types equal to it route to this agent.
    pub agent_type: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Declared capability identifiers.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Resource requirements.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Security / trust requirements.
    #[serde(default)]
    pub security: SecurityRequirements,
    /// Program launched for each instance.
    #[serde(default)]
    pub entrypoint: Option<String>,
    /// Arguments passed to the entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment applied to every instance.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl AgentDefinition {
    /// Create a definition with the required fields and empty optional ones.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            agent_type: agent_type.into(),
            tags: Vec::new(),
            capabilities: Vec::new(),
            resources: ResourceRequirements::default(),
            security: SecurityRequirements::default(),
            entrypoint: None,
            args: Vec::new(),
            environment: HashMap::new(),
        }
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set declared capability ids.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the launched program and its arguments.
    pub fn with_entrypoint(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.entrypoint = Some(program.into());
        self.args = args;
        self
    }

    /// Whether this agent declares `task_type` as its type, a tag or a capability.
    pub fn handles(&self, task_type: &str) -> bool {
        self.agent_type.eq_ignore_ascii_case(task_type)
            || self.tags.iter().any(|t| t.eq_ignore_ascii_case(task_type))
            || self
                .capabilities
                .iter()
                .any(|c| c.eq_ignore_ascii_case(task_type))
    }

    /// Reject definitions with missing identity fields.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.id.trim().is_empty() {
            return Err(SwitchyardError::Validation("agent id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "agent '{}' has no name",
                self.id
            )));
        }
        if self.agent_type.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "agent '{}' has no type",
                self.id
            )));
        }
        if self.resources.timeout_secs == 0 {
            return Err(SwitchyardError::Validation(format!(
                "agent '{}' declares a zero timeout",
                self.id
            )));
        }
        Ok(())
    }
}
