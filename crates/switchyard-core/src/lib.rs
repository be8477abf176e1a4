//! Core types and error definitions for the Switchyard orchestration engine.
//!
//! This crate provides the foundational types shared across all Switchyard
//! crates: the error taxonomy, agent and capability descriptions, health
//! states, the observer event bus, the metrics sink seam, and the snapshot
//! map used for every concurrently mutated catalog.
//!
//! # Main types
//!
//! - [`SwitchyardError`]: Unified error enum for all subsystems.
//! - [`SwitchyardResult`]: Convenience alias for `Result<T, SwitchyardError>`.
//! - [`ErrorInfo`]: Structured error (code, message, severity) attached to records.
//! - [`AgentDefinition`]: Static description of an agent kind.
//! - [`CapabilityDescriptor`]: A named, invokable unit of agent functionality.
//! - [`EventBus`]: Fire-and-forget publish/subscribe for lifecycle events.
//! - [`MetricsSink`]: Counter/gauge interface to an external metrics backend.
//! - [`SnapshotMap`]: Compare-and-swap map of immutable record snapshots.

/// Agent definitions and their requirements.
pub mod agent;
/// Capability descriptors.
pub mod capability;
/// Error taxonomy and structured error records.
pub mod error;
/// Observer notifications.
pub mod events;
/// Health states.
pub mod health;
/// Metrics sink seam.
pub mod metrics;
/// Timer-driven background passes.
pub mod periodic;
/// Snapshot map for concurrently mutated catalogs.
pub mod store;

pub use agent::{AgentDefinition, ResourceRequirements, SecurityRequirements, TrustLevel};
pub use capability::CapabilityDescriptor;
pub use error::{codes, ErrorInfo, Severity, SwitchyardError, SwitchyardResult};
pub use events::{EventBus, EventEnvelope, OrchestrationEvent};
pub use health::HealthStatus;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use periodic::run_periodic;
pub use store::{SnapshotMap, Swapped};
