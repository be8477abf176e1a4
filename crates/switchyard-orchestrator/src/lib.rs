//! Task routing, execution and scheduling for the Switchyard orchestration engine.
//!
//! Tasks are routed to the best agent instance under a pluggable strategy,
//! executed with retry, backoff and failover, and scheduled by priority,
//! due time and dependencies.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Wires runtime, registries, router and executor and runs their background loops.
//! - [`TaskRouter`]: Scores candidate agents and picks an instance per [`RoutingStrategy`].
//! - [`TaskExecutor`]: Owns task state; runs attempts, batches, the scheduler and cleanup.
//! - [`AgentTask`]: A unit of work and its lifecycle ([`TaskStatus`]).
//! - [`SwitchyardConfig`]: The `switchyard.toml` configuration file.

/// Configuration file and executor settings.
pub mod config;
/// Orchestrator facade.
pub mod engine;
/// Attempt loop, batches, scheduler and cleanup.
pub mod executor;
/// Retry classification and backoff.
pub mod retry;
/// Strategy-based routing.
pub mod router;
/// Task records and the priority queue.
pub mod store;
/// Task model.
pub mod task;

pub use config::{ExecutorConfig, SwitchyardConfig};
pub use engine::{Orchestrator, OrchestratorBuilder};
pub use executor::{batch_status, BatchOutcome, SchedulerReport, TaskExecutor};
pub use retry::{is_retryable, is_retryable_message, BackoffPolicy, RETRYABLE_SIGNALS};
pub use router::{
    balanced_score, suitability_score, ExecutionHistory, RoutingCandidate, RoutingStrategy,
    TaskRouter, TaskRoutingResult,
};
pub use store::TaskStore;
pub use task::{AgentTask, TaskResult, TaskStatus, TaskSummary};
