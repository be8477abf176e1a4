use serde::{Deserialize, Serialize};

/// Health of an instance, capability entry or agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No record, or never checked.
    #[default]
    Unknown,
    /// Alive and responsive.
    Healthy,
    /// Alive but not responsive, or backing lookup transiently failed.
    Degraded,
    /// Absent, exited, or failed its check.
    Unhealthy,
}

impl HealthStatus {
    /// Ranking used to pick the best of several statuses (higher is better).
    pub fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 3,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 1,
            HealthStatus::Unknown => 0,
        }
    }

    /// Whether work may be dispatched to something in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// The best status in an iterator, or `Unknown` when empty.
    pub fn best<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.rank())
            .unwrap_or(HealthStatus::Unknown)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = crate::SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(HealthStatus::Unknown),
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            other => Err(crate::SwitchyardError::Validation(format!(
                "unknown health status '{other}'"
            ))),
        }
    }
}
