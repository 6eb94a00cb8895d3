//! Events routed through the mesh.
//!
//! An `Event` is produced only by the bus after validation succeeds and is
//! never mutated afterwards; handlers receive it by reference.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type that matches every other type when used in a subscription
pub const WILDCARD: &str = "*";

/// Canonical event kinds known to the mesh.
///
/// The canonical string of a kind is the normalized event type carried by
/// every published `Event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventKind {
    /// A context slice was created or replaced
    ContextSlice,

    /// A context slice is being propagated to agents
    ContextPropagate,

    /// Request to run a workflow described by a DAG spec
    WorkflowOrchestrate,

    /// A workflow step is handed to its agent
    StepDispatch,

    /// An agent reports a step finished successfully
    StepCompleted,

    /// An agent reports a step failed
    StepFailed,

    /// A workflow changed state
    WorkflowStateChanged,

    /// An agent joined the mesh
    AgentRegistered,

    /// An agent changed status
    AgentStatus,

    /// Application-defined event type
    Custom(String),
}

impl EventKind {
    /// All built-in kinds, in registration order
    pub const BUILTIN: [EventKind; 9] = [
        EventKind::ContextSlice,
        EventKind::ContextPropagate,
        EventKind::WorkflowOrchestrate,
        EventKind::StepDispatch,
        EventKind::StepCompleted,
        EventKind::StepFailed,
        EventKind::WorkflowStateChanged,
        EventKind::AgentRegistered,
        EventKind::AgentStatus,
    ];

    /// Canonical (normalized) event type string
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ContextSlice => "context.slice",
            EventKind::ContextPropagate => "context.propagate",
            EventKind::WorkflowOrchestrate => "workflow.orchestrate",
            EventKind::StepDispatch => "workflow.step.dispatch",
            EventKind::StepCompleted => "workflow.step.completed",
            EventKind::StepFailed => "workflow.step.failed",
            EventKind::WorkflowStateChanged => "workflow.state.changed",
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentStatus => "agent.status",
            EventKind::Custom(name) => name,
        }
    }

    /// Resolve a canonical string back into a kind
    pub fn from_canonical(name: &str) -> Self {
        Self::BUILTIN
            .iter()
            .find(|kind| kind.as_str() == name)
            .cloned()
            .unwrap_or_else(|| EventKind::Custom(name.to_string()))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        EventKind::from_canonical(&name)
    }
}

/// A validated, normalized event recorded in the bus history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Canonical event type
    pub event_type: EventKind,

    /// Opaque payload, already validated against the type's schema
    pub payload: Value,

    /// Referenced context slice id, if any
    pub context: Option<String>,

    /// Agent that published the event
    pub source_agent: String,

    /// Restricts delivery to these agents when set
    pub target_agents: Option<Vec<String>>,

    /// When the bus accepted the event
    pub timestamp: DateTime<Utc>,

    /// Position in the bus history; strictly increasing
    pub sequence: u64,

    /// Trace identifier assigned by the bus
    pub trace_id: Uuid,

    /// Links a request to its completion events
    pub correlation_id: String,

    /// Delivery de-duplication key
    pub fingerprint: Option<String>,
}

impl Event {
    /// Whether a subscription for `event_type` should see this event
    pub fn matches_type(&self, event_type: &str) -> bool {
        event_type == WILDCARD || self.event_type.as_str() == event_type
    }

    /// Whether the event may be delivered to `agent_id`
    pub fn is_addressed_to(&self, agent_id: &str) -> bool {
        match &self.target_agents {
            Some(targets) => targets.iter().any(|t| t == agent_id),
            None => true,
        }
    }

    /// Read a string field from the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

/// A publish request, before validation.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: Value,
    pub source_agent: String,
    pub correlation_id: Option<String>,
    pub target_agents: Option<Vec<String>>,
    pub context: Option<String>,
    pub fingerprint: Option<String>,
}

impl EventDraft {
    /// Create a draft with the required fields
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        source_agent: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_agent: source_agent.into(),
            correlation_id: None,
            target_agents: None,
            context: None,
            fingerprint: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.target_agents = Some(targets);
        self
    }

    pub fn with_context(mut self, slice_id: impl Into<String>) -> Self {
        self.context = Some(slice_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}
