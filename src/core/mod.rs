//! Core orchestration logic.
//!
//! This module contains:
//! - Schema registry and validator: typed payload checks and type normalization
//! - EventBus: validated publish/subscribe with bounded history
//! - Context: TTL-bounded slice store and propagation
//! - Workflow and DAG: workflow specs and their step graphs
//! - Orchestrator: asynchronous DAG execution engine
//! - Observability: traces, validation statistics and interactions
//! - AgentMesh: facade wiring everything together

pub mod bus;
pub mod context;
pub mod dag;
pub mod fingerprint;
pub mod mesh;
pub mod observability;
pub mod orchestrator;
pub mod schema;
pub mod validator;
pub mod workflow;

// Re-export commonly used types
pub use bus::{handler_fn, EventBus, EventHandler, SubscriptionId};
pub use context::{
    ContextFilter, ContextPropagator, ContextStore, PropagationOptions, PropagationResult,
    PropagationType,
};
pub use dag::StepGraph;
pub use fingerprint::{hash_input, hash_payload, step_fingerprint};
pub use mesh::AgentMesh;
pub use observability::{Interaction, InteractionOutcome, ObservabilitySink, ValidationStats};
pub use orchestrator::{
    OrchestratorSettings, WorkflowOrchestrator, WorkflowSubmission, ORCHESTRATOR_AGENT,
};
pub use schema::{FieldRule, FieldType, Schema, SchemaRegistry};
pub use validator::{NormalizedEvent, ValidationResult, Validator};
pub use workflow::{BackoffStrategy, RetryPolicy, StepSpec, WorkflowSpec};
