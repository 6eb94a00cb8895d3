//! agent-mesh - In-process event mesh and DAG workflow orchestrator
//!
//! The orchestration core of a multi-agent system: agents exchange validated
//! events over a single-process bus, share TTL-bounded context slices, and
//! are driven through multi-step workflows expressed as dependency graphs.
//!
//! # Architecture
//!
//! Workflow state is event-sourced:
//! - Every state transition is recorded as an immutable trace
//! - Current state is derived by applying traces in order
//! - Step completion is signalled by correlation-keyed follow-up events
//!
//! # Modules
//!
//! - `agents`: Pluggable agent capabilities
//! - `core`: Validation, routing, context, orchestration, observability
//! - `domain`: Data structures (Event, TraceEvent, ContextSlice, WorkflowRecord)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a workflow graph
//! agent-mesh check workflows/research.yaml
//!
//! # Validate a payload
//! echo '{"id": "ctx-1"}' | agent-mesh validate context_slice
//! ```

pub mod agents;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use agents::{capability_fn, AgentCapability, StepRequest};
pub use config::MeshConfig;
pub use core::{AgentMesh, EventBus, WorkflowOrchestrator, WorkflowSpec};
pub use domain::{Event, EventKind, WorkflowRecord, WorkflowState};
pub use error::{MeshError, MeshResult};
