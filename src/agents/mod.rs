//! Pluggable agent capabilities.
//!
//! The core only dispatches and tracks work. What an agent actually does with
//! a `workflow.step.dispatch` event is an `AgentCapability`; attaching one to
//! the bus wires it up to report `workflow.step.completed` or
//! `workflow.step.failed` under the dispatch's correlation id.

pub mod capability;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Event;

pub use capability::{attach, CapabilityHandler};

/// The typed body of a `workflow.step.dispatch` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub workflow_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub action: String,

    #[serde(default)]
    pub parameters: Value,

    /// 1-indexed attempt number
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl StepRequest {
    /// Decode the request carried by a dispatch event
    pub fn from_event(event: &Event) -> Result<Self> {
        serde_json::from_value(event.payload.clone()).map_err(|e| {
            anyhow::anyhow!(
                "Malformed dispatch payload for '{}': {}",
                event.event_type,
                e
            )
        })
    }
}

/// Work an agent performs for a dispatched step
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Human-readable capability name
    fn name(&self) -> &str {
        "capability"
    }

    /// Handle a dispatch event and return the step output
    async fn handle(&self, event: &Event) -> Result<Value>;
}

/// Adapter turning an async closure into an `AgentCapability`
pub struct FnCapability<F>(F);

#[async_trait]
impl<F, Fut> AgentCapability for FnCapability<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<Value> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable capability
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn AgentCapability>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnCapability(f))
}
