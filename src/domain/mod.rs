//! Domain types for the agent mesh.
//!
//! This module contains the core data structures:
//! - Events: Validated messages routed by the bus
//! - Traces: Records of every state transition
//! - Context: TTL-bounded slices shared between agents
//! - Agent: Mesh participants
//! - Workflow: Runtime state of submitted workflows

pub mod agent;
pub mod context;
pub mod events;
pub mod trace;
pub mod workflow;

// Re-export commonly used types
pub use agent::{Agent, AgentStatus};
pub use context::{ContextSlice, ContextSliceData, Priority, DEFAULT_CONTEXT_TTL_MS};
pub use events::{Event, EventDraft, EventKind, WILDCARD};
pub use trace::{TraceEvent, TraceKind};
pub use workflow::{StepFailure, StepRecord, StepState, WorkflowRecord, WorkflowState};
