//! Agent and capability catalogs for the Switchyard orchestration engine.
//!
//! # Main types
//!
//! - [`AgentRegistry`]: Agent definitions, type/tag indexes, search and aggregated metrics.
//! - [`CapabilityRegistry`]: Capability entries, discovery, execution and health sweeps.
//! - [`ManifestLoader`]: Reads agent manifests and announces [`LoaderEvent`]s.

/// Agent catalog.
pub mod agents;
/// Capability catalog.
pub mod capabilities;
/// Registry configuration.
pub mod config;
/// Manifest loading.
pub mod loader;
pub mod metrics;

pub use agents::{AgentFilter, AgentRegistry, SearchHit};
pub use capabilities::{
    CapabilityQuery, CapabilityRegistry, CapabilityRegistryEntry, CapabilityRequest,
    CapabilityResponse, CapabilityUsage,
};
pub use config::{CapabilityConfig, RegistryConfig};
pub use loader::{AgentManifest, LoaderEvent, ManifestCheck, ManifestLoader};
pub use metrics::{ExecutionLedger, LoadMetrics, PerformanceMetrics};
