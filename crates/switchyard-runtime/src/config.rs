use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root under which per-instance working directories are allocated.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Process monitor interval in seconds (default: 30).
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Time a graceful stop waits before forcing termination (default: 30).
    #[serde(default = "default_grace_period")]
    pub stop_grace_period_secs: u64,
    /// Ceiling on live instances per user; creation blocks beyond it (default: 16).
    #[serde(default = "default_max_instances")]
    pub max_instances_per_user: usize,
    /// Remove an instance's working directory when it stops (default: true).
    #[serde(default = "default_true")]
    pub cleanup_work_dirs: bool,
}

fn default_work_root() -> PathBuf {
    PathBuf::from("./data/instances")
}
fn default_monitor_interval() -> u64 {
    30
}
fn default_grace_period() -> u64 {
    30
}
fn default_max_instances() -> usize {
    16
}
fn default_true() -> bool {
    true
}

impl RuntimeConfig {
    /// Monitor interval as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    /// Grace period as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Builder: set the working-directory root.
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            monitor_interval_secs: default_monitor_interval(),
            stop_grace_period_secs: default_grace_period(),
            max_instances_per_user: default_max_instances(),
            cleanup_work_dirs: true,
        }
    }
}
