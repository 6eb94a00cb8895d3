//! Event bus (mesh router).
//!
//! Central dispatcher: validates and normalizes published events, appends
//! them to a bounded history, and invokes matching subscriber handlers in
//! subscription order. Handler failures are contained at this boundary.
//!
//! History, fingerprints, subscriptions and the agent registry are each
//! guarded by their own lock; handler invocation happens with no lock held so
//! handlers may publish re-entrantly.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Agent, AgentStatus, Event, EventDraft, EventKind, TraceEvent, TraceKind, WILDCARD};
use crate::error::{MeshError, MeshResult};

use super::observability::{Interaction, InteractionOutcome, ObservabilitySink, ValidationStats};
use super::validator::{ValidationResult, Validator};

/// Default number of events kept in history
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Identifier returned by `subscribe`
pub type SubscriptionId = u64;

/// Subscriber callback invoked for every matching event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an `EventHandler`
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Subscription {
    id: SubscriptionId,
    agent_id: String,
    /// Canonical event type or `*`
    event_type: String,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct History {
    events: VecDeque<Event>,
    next_sequence: u64,
    fingerprints: HashSet<String>,
    fingerprint_order: VecDeque<String>,
}

/// In-process event mesh router
pub struct EventBus {
    validator: Arc<Validator>,
    sink: Arc<ObservabilitySink>,
    subscriptions: RwLock<Vec<Subscription>>,
    agents: RwLock<BTreeMap<String, Agent>>,
    history: Mutex<History>,
    history_limit: usize,
    next_subscription: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(
            Arc::new(Validator::default()),
            Arc::new(ObservabilitySink::default()),
            DEFAULT_HISTORY_LIMIT,
        )
    }
}

impl EventBus {
    /// Create a bus over a validator and sink
    pub fn new(validator: Arc<Validator>, sink: Arc<ObservabilitySink>, history_limit: usize) -> Self {
        Self {
            validator,
            sink,
            subscriptions: RwLock::new(Vec::new()),
            agents: RwLock::new(BTreeMap::new()),
            history: Mutex::new(History::default()),
            history_limit: history_limit.max(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn observability(&self) -> &Arc<ObservabilitySink> {
        &self.sink
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Register an agent. A shut-down agent may register again.
    #[instrument(skip(self, agent), fields(agent = %agent.id))]
    pub async fn register_agent(&self, agent: Agent) -> MeshResult<()> {
        {
            let mut agents = self.agents.write().await;
            if agents.get(&agent.id).map(Agent::is_active).unwrap_or(false) {
                return Err(MeshError::AgentAlreadyRegistered(agent.id));
            }
            agents.insert(agent.id.clone(), agent.clone());
        }

        info!(role = %agent.role, "Agent registered");
        self.publish(
            EventKind::AgentRegistered.as_str(),
            json!({ "agentId": agent.id, "role": agent.role }),
            &agent.id,
        )
        .await;
        Ok(())
    }

    /// Change an agent's status
    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> MeshResult<()> {
        {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| MeshError::UnknownAgent(agent_id.to_string()))?;
            agent.status = status;
        }

        debug!(agent = %agent_id, status = status.as_str(), "Agent status changed");
        self.publish(
            EventKind::AgentStatus.as_str(),
            json!({ "agentId": agent_id, "status": status.as_str() }),
            agent_id,
        )
        .await;
        Ok(())
    }

    /// Mark an agent shut down and drop all of its subscriptions
    pub async fn shutdown_agent(&self, agent_id: &str) -> MeshResult<()> {
        self.set_agent_status(agent_id, AgentStatus::Shutdown).await?;
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.agent_id != agent_id);
        info!(
            agent = %agent_id,
            dropped = before - subscriptions.len(),
            "Agent shut down"
        );
        Ok(())
    }

    /// Snapshot of registered agents, ordered by id
    pub async fn agents(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a handler for `(agent_id, event_type)`.
    ///
    /// Handlers are appended; `*` subscribes to every type. Aliases are
    /// normalized so the subscription matches the canonical type.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let event_type = if event_type == WILDCARD {
            WILDCARD.to_string()
        } else {
            match self.validator.normalize(event_type) {
                Some(kind) => kind.as_str().to_string(),
                None => {
                    warn!(agent = %agent_id, %event_type, "Subscribing to unregistered event type");
                    event_type.to_string()
                }
            }
        };

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        debug!(agent = %agent_id, %event_type, subscription = id, "Subscribed");

        self.subscriptions.write().await.push(Subscription {
            id,
            agent_id: agent_id.to_string(),
            event_type,
            handler,
        });
        id
    }

    /// Remove a subscription; returns whether it existed
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Distinct agents holding at least one subscription, in subscription order
    pub async fn subscribed_agents(&self) -> Vec<String> {
        let subscriptions = self.subscriptions.read().await;
        let mut seen = HashSet::new();
        subscriptions
            .iter()
            .filter(|s| seen.insert(s.agent_id.clone()))
            .map(|s| s.agent_id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Validate and publish an event. Never fails: invalid events are
    /// logged, counted and dropped.
    pub async fn publish(&self, event_type: &str, payload: Value, source_agent: &str) -> ValidationResult {
        self.publish_draft(EventDraft::new(event_type, payload, source_agent))
            .await
    }

    /// Publish with correlation id, targets, context reference or fingerprint
    pub async fn publish_draft(&self, draft: EventDraft) -> ValidationResult {
        self.publish_event(draft).await.0
    }

    /// Like `publish_draft`, also returning the event as delivered.
    ///
    /// The event is `None` when validation failed or the fingerprint was a
    /// duplicate.
    pub async fn publish_event(&self, draft: EventDraft) -> (ValidationResult, Option<Event>) {
        let mut result = self.validator.validate(&draft.event_type, &draft.payload);
        self.sink.record_validation(&draft.event_type, &result).await;

        let normalized = match (&result.normalized_event, result.valid) {
            (Some(normalized), true) => normalized.clone(),
            _ => {
                warn!(
                    event_type = %draft.event_type,
                    source = %draft.source_agent,
                    errors = ?result.errors,
                    "Dropping invalid event"
                );
                self.sink
                    .record(TraceEvent::new(
                        TraceKind::EventRejected,
                        format!(
                            "Event '{}' from '{}' rejected: {}",
                            draft.event_type,
                            draft.source_agent,
                            result.errors.join("; ")
                        ),
                    ))
                    .await;
                return (result, None);
            }
        };

        let event = {
            let mut history = self.history.lock().await;

            if let Some(ref fingerprint) = draft.fingerprint {
                if history.fingerprints.contains(fingerprint) {
                    drop(history);
                    debug!(%fingerprint, "Dropping duplicate event");
                    self.sink.record_duplicate().await;
                    self.sink
                        .record(
                            TraceEvent::new(
                                TraceKind::DuplicateDropped,
                                format!("Duplicate '{}' not delivered", fingerprint),
                            )
                            .with_correlation(fingerprint.clone()),
                        )
                        .await;
                    result
                        .warnings
                        .push(format!("duplicate fingerprint '{}', not delivered", fingerprint));
                    return (result, None);
                }
            }

            history.next_sequence += 1;
            let trace_id = Uuid::new_v4();
            let event = Event {
                id: Uuid::new_v4(),
                event_type: normalized.event_type,
                payload: normalized.payload,
                context: draft.context.or(normalized.context),
                source_agent: draft.source_agent,
                target_agents: draft.target_agents,
                timestamp: Utc::now(),
                sequence: history.next_sequence,
                trace_id,
                correlation_id: draft
                    .correlation_id
                    .unwrap_or_else(|| trace_id.to_string()),
                fingerprint: draft.fingerprint,
            };

            if let Some(ref fingerprint) = event.fingerprint {
                history.fingerprints.insert(fingerprint.clone());
                history.fingerprint_order.push_back(fingerprint.clone());
                if history.fingerprint_order.len() > self.history_limit {
                    if let Some(oldest) = history.fingerprint_order.pop_front() {
                        history.fingerprints.remove(&oldest);
                    }
                }
            }

            history.events.push_back(event.clone());
            if history.events.len() > self.history_limit {
                history.events.pop_front();
            }

            event
        };

        self.deliver(&event).await;
        (result, Some(event))
    }

    /// Invoke every matching handler in subscription order, isolating failures
    async fn deliver(&self, event: &Event) {
        let matching: Vec<(String, Arc<dyn EventHandler>)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| event.matches_type(&s.event_type) && event.is_addressed_to(&s.agent_id))
                .map(|s| (s.agent_id.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        debug!(
            event_type = %event.event_type,
            sequence = event.sequence,
            handlers = matching.len(),
            "Delivering event"
        );

        for (agent_id, handler) in matching {
            let outcome = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => InteractionOutcome::Delivered,
                Ok(Err(e)) => InteractionOutcome::Failed {
                    error: format!("{:#}", e),
                },
                Err(panic) => InteractionOutcome::Failed {
                    error: format!("handler panicked: {}", panic_message(panic.as_ref())),
                },
            };

            if let InteractionOutcome::Failed { ref error } = outcome {
                warn!(
                    agent = %agent_id,
                    event_type = %event.event_type,
                    %error,
                    "Handler failed"
                );
                self.sink
                    .record(
                        TraceEvent::new(
                            TraceKind::HandlerFailed,
                            format!("Handler of '{}' failed on '{}': {}", agent_id, event.event_type, error),
                        )
                        .with_trace_id(event.trace_id)
                        .with_correlation(event.correlation_id.clone()),
                    )
                    .await;
            }

            self.sink
                .record_interaction(Interaction {
                    from_agent: event.source_agent.clone(),
                    to_agent: agent_id,
                    event_type: event.event_type.to_string(),
                    trace_id: event.trace_id,
                    correlation_id: event.correlation_id.clone(),
                    timestamp: Utc::now(),
                    outcome,
                })
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Read snapshots
    // ------------------------------------------------------------------

    /// The most recent `limit` events, oldest first
    pub async fn event_history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().await;
        let skip = history.events.len().saturating_sub(limit);
        history.events.iter().skip(skip).cloned().collect()
    }

    pub async fn validation_stats(&self) -> ValidationStats {
        self.sink.validation_stats().await
    }

    pub async fn agent_interactions(&self, agent_id: &str) -> Vec<Interaction> {
        self.sink.agent_interactions(agent_id).await
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
