//! Error taxonomy for the mesh.
//!
//! Only structural problems surface as `Err`: malformed context slices,
//! malformed workflow graphs and agent registry misuse. Validation failures
//! are reported through `ValidationResult`, and step failures become
//! workflow state rather than errors.

use thiserror::Error;

/// Result alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors raised synchronously at the mesh boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("Invalid context slice: {0}")]
    InvalidContext(String),

    #[error("Workflow contains a dependency cycle through steps: {}", steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownStepReference { step: String, dependency: String },

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow '{0}' is already active")]
    WorkflowAlreadyActive(String),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Agent '{0}' is already registered")]
    AgentAlreadyRegistered(String),

    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),
}
