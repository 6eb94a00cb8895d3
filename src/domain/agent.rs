//! Agents registered on the mesh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A participant on the mesh. Agents own nothing but their subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Unique agent id
    pub id: String,

    /// Free-form role, e.g. "planner"
    pub role: String,

    pub status: AgentStatus,

    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Create an agent in the `initializing` state
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            status: AgentStatus::Initializing,
            registered_at: Utc::now(),
        }
    }

    /// Builder-style status override
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the agent should receive events
    pub fn is_active(&self) -> bool {
        !matches!(self.status, AgentStatus::Shutdown)
    }
}

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Degraded,
    Shutdown,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Ready => "ready",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Shutdown => "shutdown",
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Initializing
    }
}
