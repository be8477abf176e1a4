use crate::{SwitchyardError, SwitchyardResult};
use serde::{Deserialize, Serialize};

/// A named, independently invokable unit of agent functionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability identifier (e.g. `vision.observe`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What the capability does.
    #[serde(default)]
    pub description: String,
    /// Category used for discovery and task-type matching.
    pub category: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Permissions a caller must hold to invoke it.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Capability version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional JSON schema for the input payload.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl CapabilityDescriptor {
    /// Create a descriptor with the required fields.
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: category.into(),
            tags: Vec::new(),
            required_permissions: Vec::new(),
            version: default_version(),
            input_schema: None,
        }
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

    /// Builder: set required permissions.
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Reject descriptors without id, name or category.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.id.trim().is_empty() {
            return Err(SwitchyardError::Validation("capability id is required".into()));
        }
        if self.name.trim().is_empty() || self.category.trim().is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "capability '{}' needs a name and a category",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cap = CapabilityDescriptor::new("vision.observe", "Observe", "vision")
            .with_tags(["camera"])
            .with_permissions(["device.camera"]);
        assert_eq!(cap.tags, vec!["camera"]);
        assert_eq!(cap.required_permissions, vec!["device.camera"]);
        assert!(cap.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(CapabilityDescriptor::new("", "n", "c").validate().is_err());
        assert!(CapabilityDescriptor::new("x", "n", "").validate().is_err());
    }
}
