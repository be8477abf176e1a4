use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the agent registry's metrics refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Delay before the first metrics refresh in seconds (default: 30).
    #[serde(default = "default_metrics_delay")]
    pub metrics_initial_delay_secs: u64,
    /// Metrics refresh interval in seconds (default: 60).
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_metrics_delay() -> u64 {
    30
}
fn default_metrics_interval() -> u64 {
    60
}

impl RegistryConfig {
    /// Initial delay as a `Duration`.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.metrics_initial_delay_secs)
    }

    /// Refresh interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            metrics_initial_delay_secs: default_metrics_delay(),
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

/// Configuration for the capability registry's health sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Delay before the first health sweep in seconds (default: 300).
    #[serde(default = "default_health_delay")]
    pub health_initial_delay_secs: u64,
    /// Health sweep interval in seconds (default: 3600).
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_health_delay() -> u64 {
    300
}
fn default_health_interval() -> u64 {
    3600
}

impl CapabilityConfig {
    /// Initial delay as a `Duration`.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.health_initial_delay_secs)
    }

    /// Sweep interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            health_initial_delay_secs: default_health_delay(),
            health_interval_secs: default_health_interval(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let registry = RegistryConfig::default();
        assert_eq!(registry.initial_delay(), Duration::from_secs(30));
        assert_eq!(registry.interval(), Duration::from_secs(60));
        let caps = CapabilityConfig::default();
        assert_eq!(caps.initial_delay(), Duration::from_secs(300));
        assert_eq!(caps.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_deserialize_overrides() {
        let caps: CapabilityConfig =
            serde_json::from_str(r#"{"health_interval_secs": 120}"#).unwrap();
        assert_eq!(caps.health_interval_secs, 120);
        assert_eq!(caps.health_initial_delay_secs, 300);
    }
}
