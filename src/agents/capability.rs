//! Bus handler running an `AgentCapability` for dispatched steps.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::bus::{panic_message, EventBus, EventHandler, SubscriptionId};
use crate::domain::{Agent, AgentStatus, Event, EventDraft, EventKind};
use crate::error::MeshResult;

use super::{AgentCapability, StepRequest};

/// Subscribed to `workflow.step.dispatch` on behalf of one agent.
///
/// The capability runs on its own task so `publish` returns as soon as the
/// dispatch is handed off; the result comes back as a follow-up event.
pub struct CapabilityHandler {
    agent_id: String,
    capability: Arc<dyn AgentCapability>,
    bus: Weak<EventBus>,
}

impl CapabilityHandler {
    pub fn new(agent_id: impl Into<String>, capability: Arc<dyn AgentCapability>, bus: Weak<EventBus>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capability,
            bus,
        }
    }
}

#[async_trait]
impl EventHandler for CapabilityHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        let request = StepRequest::from_event(event)?;
        if request.agent_id != self.agent_id {
            return Ok(());
        }

        debug!(
            agent = %self.agent_id,
            capability = self.capability.name(),
            workflow = %request.workflow_id,
            step = %request.step_id,
            attempt = request.attempt,
            "Running capability"
        );

        let capability = Arc::clone(&self.capability);
        let bus = self.bus.clone();
        let agent_id = self.agent_id.clone();
        let event = event.clone();

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(capability.handle(&event))
                .catch_unwind()
                .await;

            let (kind, payload) = match outcome {
                Ok(Ok(output)) => (
                    EventKind::StepCompleted,
                    json!({
                        "workflowId": request.workflow_id,
                        "stepId": request.step_id,
                        "attempt": request.attempt,
                        "output": output,
                    }),
                ),
                Ok(Err(e)) => (
                    EventKind::StepFailed,
                    json!({
                        "workflowId": request.workflow_id,
                        "stepId": request.step_id,
                        "attempt": request.attempt,
                        "error": format!("{:#}", e),
                    }),
                ),
                Err(panic) => (
                    EventKind::StepFailed,
                    json!({
                        "workflowId": request.workflow_id,
                        "stepId": request.step_id,
                        "attempt": request.attempt,
                        "error": format!("capability panicked: {}", panic_message(panic.as_ref())),
                    }),
                ),
            };

            let Some(bus) = bus.upgrade() else {
                debug!(agent = %agent_id, "Bus dropped before capability finished");
                return;
            };

            let draft = EventDraft::new(kind.as_str(), payload, agent_id.clone())
                .with_correlation(event.correlation_id.clone());
            let result = bus.publish_draft(draft).await;
            if !result.valid {
                warn!(agent = %agent_id, errors = ?result.errors, "Capability result rejected");
            }
        });

        Ok(())
    }
}

/// Register `agent` (unless already active), subscribe its capability to
/// step dispatches and mark it ready.
pub async fn attach(
    bus: &Arc<EventBus>,
    agent: Agent,
    capability: Arc<dyn AgentCapability>,
) -> MeshResult<SubscriptionId> {
    let agent_id = agent.id.clone();
    let active = bus.agent(&agent_id).await.is_some_and(|a| a.is_active());
    if !active {
        bus.register_agent(agent).await?;
    }

    let handler = CapabilityHandler::new(agent_id.clone(), capability, Arc::downgrade(bus));
    let subscription = bus
        .subscribe(&agent_id, EventKind::StepDispatch.as_str(), Arc::new(handler))
        .await;

    bus.set_agent_status(&agent_id, AgentStatus::Ready).await?;
    Ok(subscription)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::capability_fn;
    use crate::core::bus::handler_fn;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn dispatch_payload(agent: &str) -> Value {
        json!({
            "workflowId": "wf1",
            "stepId": "s1",
            "agentId": agent,
            "action": "validate",
            "attempt": 2
        })
    }

    async fn collect_results(bus: &Arc<EventBus>) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in [EventKind::StepCompleted, EventKind::StepFailed] {
            let tx = tx.clone();
            bus.subscribe(
                "observer",
                kind.as_str(),
                handler_fn(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                        Ok(())
                    }
                }),
            )
            .await;
        }
        rx
    }

    #[tokio::test]
    async fn test_success_reports_completion() {
        let bus = Arc::new(EventBus::default());
        let mut results = collect_results(&bus).await;
        attach(
            &bus,
            Agent::new("a", "validator"),
            capability_fn(|_event| async move { Ok(json!({"ok": true})) }),
        )
        .await
        .unwrap();

        bus.publish_draft(
            EventDraft::new("workflow.step.dispatch", dispatch_payload("a"), "orchestrator")
                .with_targets(vec!["a".to_string()])
                .with_correlation("corr-1"),
        )
        .await;

        let event = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventKind::StepCompleted);
        assert_eq!(event.correlation_id, "corr-1");
        assert_eq!(event.payload["output"]["ok"], true);
        assert_eq!(event.payload["attempt"], 2);
        assert_eq!(bus.agent("a").await.map(|a| a.status), Some(AgentStatus::Ready));
    }

    #[tokio::test]
    async fn test_panic_reports_failure() {
        let bus = Arc::new(EventBus::default());
        let mut results = collect_results(&bus).await;
        attach(
            &bus,
            Agent::new("a", "validator"),
            capability_fn(|_event| async move {
                if true {
                    panic!("exploded");
                }
                Ok(Value::Null)
            }),
        )
        .await
        .unwrap();

        bus.publish_draft(
            EventDraft::new("workflow.step.dispatch", dispatch_payload("a"), "orchestrator")
                .with_correlation("corr-2"),
        )
        .await;

        let event = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventKind::StepFailed);
        assert_eq!(event.correlation_id, "corr-2");
        assert!(event.payload_str("error").unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn test_ignores_other_agents_steps() {
        let bus = Arc::new(EventBus::default());
        let mut results = collect_results(&bus).await;
        attach(
            &bus,
            Agent::new("a", "validator"),
            capability_fn(|_event| async move { Ok(Value::Null) }),
        )
        .await
        .unwrap();

        bus.publish("workflow.step.dispatch", dispatch_payload("b"), "orchestrator")
            .await;

        let received = tokio::time::timeout(Duration::from_millis(100), results.recv()).await;
        assert!(received.is_err());
    }
}
