//! Trace records for every state transition in the mesh.
//!
//! Workflow state is event-sourced: the orchestrator emits a `TraceEvent`
//! for each transition and applies it to the `WorkflowRecord`, so a record
//! can always be rebuilt by replaying its traces in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::StepFailure;

/// A single transition recorded by the observability sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// Unique identifier for this trace record
    pub id: Uuid,

    /// When the transition happened
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: TraceKind,

    /// Workflow the transition belongs to (if applicable)
    pub workflow_id: Option<String>,

    /// Step the transition belongs to (if applicable)
    pub step_id: Option<String>,

    /// Bus trace id of the related event
    pub trace_id: Option<Uuid>,

    /// Correlation id of the related request
    pub correlation_id: Option<String>,

    /// Attempt number for step transitions (1-indexed)
    pub attempt: Option<u32>,

    /// Human-readable summary
    pub summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Structured failure, for failed steps
    pub failure: Option<StepFailure>,

    /// Step output, for completed steps
    pub output: Option<serde_json::Value>,
}

impl TraceEvent {
    /// Create a trace with the current timestamp
    pub fn new(kind: TraceKind, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            workflow_id: None,
            step_id: None,
            trace_id: None,
            correlation_id: None,
            attempt: None,
            summary: summary.into(),
            duration_ms: None,
            failure: None,
            output: None,
        }
    }

    /// Trace scoped to a workflow
    pub fn workflow(kind: TraceKind, workflow_id: &str, summary: impl Into<String>) -> Self {
        let mut trace = Self::new(kind, summary);
        trace.workflow_id = Some(workflow_id.to_string());
        trace
    }

    /// Trace scoped to a workflow step
    pub fn step(
        kind: TraceKind,
        workflow_id: &str,
        step_id: &str,
        summary: impl Into<String>,
    ) -> Self {
        let mut trace = Self::workflow(kind, workflow_id, summary);
        trace.step_id = Some(step_id.to_string());
        trace
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_failure(mut self, failure: StepFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Kinds of transitions recorded by the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// Workflow accepted and recorded as pending
    WorkflowSubmitted,

    /// Workflow scheduler started
    WorkflowStarted,

    /// Every step completed
    WorkflowCompleted,

    /// At least one step failed
    WorkflowFailed,

    /// Workflow deadline elapsed
    WorkflowTimedOut,

    /// All dependencies of a step completed
    StepReady,

    /// A step attempt was handed to its agent
    StepDispatched,

    /// A step completed successfully
    StepCompleted,

    /// A step attempt failed and will be retried
    StepRetrying,

    /// A step failed terminally
    StepFailed,

    /// A running step was abandoned by a workflow timeout
    StepCancelled,

    /// An event failed validation and was dropped
    EventRejected,

    /// An event with an already delivered fingerprint was dropped
    DuplicateDropped,

    /// A subscriber handler returned an error or panicked
    HandlerFailed,

    /// A context slice was propagated
    ContextPropagated,
}
