use crate::retry::BackoffPolicy;
use crate::router::RoutingStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use switchyard_registry::{CapabilityConfig, RegistryConfig};
use switchyard_runtime::RuntimeConfig;
use tracing::info;

/// Configuration for the task executor and its background passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Scheduler pass interval in seconds (default: 5).
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
    /// Tasks dispatched per scheduler pass at most (default: 10).
    #[serde(default = "default_scheduler_batch")]
    pub scheduler_batch_size: usize,
    /// Cleanup pass interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// How long terminal tasks are kept, in seconds (default: 7 days).
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Concurrent workers for parallel batches (default: available parallelism).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// First retry delay in milliseconds (default: 100).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Retry delay cap in milliseconds (default: 30000).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Upward jitter as a fraction of the delay (default: 0.1).
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// Strategy used when a caller does not name one (default: balanced).
    #[serde(default)]
    pub default_strategy: RoutingStrategy,
}

const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_scheduler_interval() -> u64 {
    5
}
fn default_scheduler_batch() -> usize {
    10
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_retention() -> u64 {
    7 * 24 * 60 * 60
}
fn default_max_parallel() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}
fn default_backoff_base() -> u64 {
    100
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_backoff_jitter() -> f64 {
    0.1
}

impl ExecutorConfig {
    /// Scheduler interval as a `Duration`.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }

    /// Cleanup interval as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Retention window, capped at 100 years.
    pub fn retention(&self) -> chrono::Duration {
        let secs = self.retention_secs.min(MAX_RETENTION_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(100 * 365))
    }

    /// Backoff derived from the `backoff_*` fields.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: self.backoff_base_ms,
            max_ms: self.backoff_max_ms,
            jitter: self.backoff_jitter,
        }
    }

    /// Builder: set the backoff base and cap.
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: default_scheduler_interval(),
            scheduler_batch_size: default_scheduler_batch(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention_secs: default_retention(),
            max_parallel: default_max_parallel(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            backoff_jitter: default_backoff_jitter(),
            default_strategy: RoutingStrategy::default(),
        }
    }
}

fn default_owner() -> String {
    "local".to_string()
}

/// Top-level configuration file (`switchyard.toml`).
///
/// ```toml
/// owner = "ops"
///
/// [runtime]
/// work_root = "/var/lib/switchyard"
///
/// [executor]
/// default_strategy = "least_connections"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Tenant identity instances are created under.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Agent runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Agent registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Capability registry settings.
    #[serde(default)]
    pub capabilities: CapabilityConfig,
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for SwitchyardConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            runtime: RuntimeConfig::default(),
            registry: RegistryConfig::default(),
            capabilities: CapabilityConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl SwitchyardConfig {
    /// Parse configuration text.
    pub fn from_toml(raw: &str) -> SwitchyardResult<Self> {
        toml::from_str(raw).map_err(|e| SwitchyardError::Config(format!("invalid configuration: {e}")))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> SwitchyardResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwitchyardError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.scheduler_interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler_batch_size, 10);
        assert_eq!(config.retention(), chrono::Duration::days(7));
        assert!(config.max_parallel >= 1);
        assert_eq!(config.backoff(), BackoffPolicy::default());
        assert_eq!(config.default_strategy, RoutingStrategy::Balanced);
    }

    #[test]
    fn test_huge_retention_is_capped() {
        let config = ExecutorConfig {
            retention_secs: u64::MAX,
            ..ExecutorConfig::default()
        };
        assert_eq!(config.retention(), chrono::Duration::days(100 * 365));
        assert!(chrono::Utc::now().checked_sub_signed(config.retention()).is_some());
    }

    #[test]
    fn test_partial_file() {
        let config = SwitchyardConfig::from_toml(
            r#"
owner = "ops"

[executor]
default_strategy = "round_robin"
backoff_base_ms = 5
"#,
        )
        .unwrap();
        assert_eq!(config.owner, "ops");
        assert_eq!(config.executor.default_strategy, RoutingStrategy::RoundRobin);
        assert_eq!(config.executor.backoff_base_ms, 5);
        assert_eq!(config.executor.backoff_max_ms, 30_000);
        assert_eq!(config.runtime.monitor_interval_secs, 30);
    }

    #[test]
    fn test_missing_file_is_default_and_bad_file_is_error() {
        let config = SwitchyardConfig::load(Path::new("/nonexistent/switchyard.toml")).unwrap();
        assert_eq!(config.owner, "local");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(&path, "owner = [").unwrap();
        let err = SwitchyardConfig::load(&path).unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
    }
}
