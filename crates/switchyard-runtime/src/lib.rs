//! Agent instance lifecycle for the Switchyard orchestration engine.
//!
//! The runtime creates, starts, stops, pauses, resumes and destroys agent
//! instances, samples their resource usage, and dispatches invocations to
//! them. The OS is reached only through the [`ProcessControl`] seam and the
//! wire only through the [`AgentEndpoint`] seam, so both can be faked.
//!
//! # Main types
//!
//! - [`AgentRuntime`]: Sole owner of instance state; lifecycle state machine and monitor.
//! - [`AgentInstance`]: Snapshot of one instance.
//! - [`ProcessControl`]: Spawn/terminate/suspend/resume/sample capability.
//! - [`AgentEndpoint`]: Delivers an [`Invocation`] to a running instance.

/// Runtime configuration.
pub mod config;
/// Invocation transport seam.
pub mod endpoint;
/// Instance records and lifecycle states.
pub mod instance;
/// Process/OS layer seam.
pub mod process;
/// The agent runtime.
pub mod runtime;
pub mod stdio;

pub use config::RuntimeConfig;
pub use endpoint::{AgentEndpoint, EchoEndpoint, Invocation, ProcessEndpoint};
pub use instance::{AgentInstance, InstanceConfig, InstanceStatus, ResourceUsage};
pub use process::{
    LaunchSpec, LocalProcessControl, ProcessControl, ProcessState, SimulatedProcessControl,
};
pub use runtime::{AgentRuntime, MonitorReport};
pub use stdio::StdioChannel;
