//! Context store and propagator.
//!
//! The store owns slice lifecycle: creation, replacement (last write by
//! creation time wins) and TTL expiry, checked lazily on read and swept in
//! the background. The propagator stores a slice and announces it to the
//! resolved recipients through one `context.propagate` event.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    ContextSlice, ContextSliceData, EventDraft, EventKind, TraceEvent, TraceKind,
    DEFAULT_CONTEXT_TTL_MS,
};
use crate::error::{MeshError, MeshResult};

use super::bus::EventBus;

fn is_expired(slice: &ContextSlice, now: DateTime<Utc>) -> bool {
    now >= slice.expires_at()
}

/// TTL-bounded slice storage
#[derive(Debug)]
pub struct ContextStore {
    slices: DashMap<String, ContextSlice>,
    default_ttl: Duration,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONTEXT_TTL_MS))
    }
}

impl ContextStore {
    /// Create a store; slices created without a TTL get `default_ttl`
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            slices: DashMap::new(),
            default_ttl,
        }
    }

    /// Build a slice from raw data without storing it
    pub fn build(&self, data: ContextSliceData) -> MeshResult<ContextSlice> {
        let id = match data.id {
            Some(id) if !id.trim().is_empty() => id,
            Some(_) => {
                return Err(MeshError::InvalidContext(
                    "context slice id must not be empty".to_string(),
                ))
            }
            None => {
                return Err(MeshError::InvalidContext(
                    "context slice requires an id".to_string(),
                ))
            }
        };

        Ok(ContextSlice {
            id,
            user_id: data.user_id,
            session_id: data.session_id,
            domain: data.domain,
            state: data.state,
            metadata: data.metadata,
            ttl_ms: data
                .ttl_ms
                .unwrap_or(self.default_ttl.as_millis() as u64),
            priority: data.priority.unwrap_or_default(),
            created_at: Utc::now(),
        })
    }

    /// Validate, build and store a slice
    pub fn create(&self, data: ContextSliceData) -> MeshResult<ContextSlice> {
        let slice = self.build(data)?;
        self.insert(slice.clone());
        debug!(slice = %slice.id, ttl_ms = slice.ttl_ms, "Context slice created");
        Ok(slice)
    }

    /// Store a slice, superseding an existing one with the same id unless
    /// the stored one was created later. Returns whether the slice was stored.
    pub fn insert(&self, slice: ContextSlice) -> bool {
        let now = Utc::now();
        match self.slices.entry(slice.id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if is_expired(current, now) || slice.created_at >= current.created_at {
                    entry.insert(slice);
                    true
                } else {
                    debug!(slice = %slice.id, "Ignoring slice older than the stored one");
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(slice);
                true
            }
        }
    }

    /// Look up a live slice; expired slices are removed and reported missing
    pub fn get(&self, id: &str) -> Option<ContextSlice> {
        let now = Utc::now();

        if self
            .slices
            .remove_if(id, |_, slice| is_expired(slice, now))
            .is_some()
        {
            debug!(slice = %id, "Context slice expired");
            return None;
        }

        self.slices
            .get(id)
            .filter(|slice| !is_expired(slice, now))
            .map(|slice| slice.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<ContextSlice> {
        self.slices.remove(id).map(|(_, slice)| slice)
    }

    /// Remove every expired slice, returning how many were purged
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .slices
            .iter()
            .filter(|entry| is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|id| {
                self.slices
                    .remove_if(id.as_str(), |_, slice| is_expired(slice, now))
                    .is_some()
            })
            .count()
    }

    /// Number of stored slices, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Periodically purge expired slices until the store is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Swept expired context slices");
                }
            }
        })
    }
}

/// How recipients of a propagation are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationType {
    /// Every currently subscribed agent
    Broadcast,
    /// Exactly the listed agents
    #[default]
    Targeted,
    /// Listed agents accepted by the predicate
    Filtered,
}

impl PropagationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Targeted => "targeted",
            Self::Filtered => "filtered",
        }
    }
}

/// Recipient predicate for filtered propagation: `(agent_id, slice)`
pub type ContextFilter = Arc<dyn Fn(&str, &ContextSlice) -> bool + Send + Sync>;

/// Options for `ContextPropagator::propagate`
#[derive(Clone)]
pub struct PropagationOptions {
    pub propagation_type: PropagationType,
    pub filter: Option<ContextFilter>,
    /// Agent reported as the source of the propagation event
    pub source_agent: String,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            propagation_type: PropagationType::Targeted,
            filter: None,
            source_agent: "context-store".to_string(),
        }
    }
}

impl fmt::Debug for PropagationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationOptions")
            .field("propagation_type", &self.propagation_type)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("source_agent", &self.source_agent)
            .finish()
    }
}

impl PropagationOptions {
    pub fn broadcast() -> Self {
        Self {
            propagation_type: PropagationType::Broadcast,
            ..Default::default()
        }
    }

    pub fn targeted() -> Self {
        Self::default()
    }

    pub fn filtered<F>(filter: F) -> Self
    where
        F: Fn(&str, &ContextSlice) -> bool + Send + Sync + 'static,
    {
        Self {
            propagation_type: PropagationType::Filtered,
            filter: Some(Arc::new(filter)),
            ..Default::default()
        }
    }

    pub fn from_agent(mut self, source_agent: impl Into<String>) -> Self {
        self.source_agent = source_agent.into();
        self
    }
}

/// Outcome of a propagation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationResult {
    pub success: bool,
    pub slice_id: String,
    /// Resolved recipients, in resolution order
    pub delivered_to: Vec<String>,
    pub errors: Vec<String>,
    /// Trace id of the `context.propagate` event, when one was published
    pub trace_id: Option<Uuid>,
}

impl PropagationResult {
    fn failed(slice_id: &str, errors: Vec<String>) -> Self {
        Self {
            success: false,
            slice_id: slice_id.to_string(),
            delivered_to: Vec::new(),
            errors,
            trace_id: None,
        }
    }
}

/// Stores slices and announces them over the bus
pub struct ContextPropagator {
    store: Arc<ContextStore>,
    bus: Arc<EventBus>,
}

impl ContextPropagator {
    pub fn new(store: Arc<ContextStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Propagate a slice to agents chosen by `options`.
    ///
    /// Invalid input is reported in the result and nothing is delivered.
    pub async fn propagate(
        &self,
        slice: &ContextSlice,
        target_agents: &[String],
        options: &PropagationOptions,
    ) -> PropagationResult {
        let mut errors = Vec::new();
        if slice.id.trim().is_empty() {
            errors.push("context slice id must not be empty".to_string());
        }
        if options.propagation_type != PropagationType::Broadcast && target_agents.is_empty() {
            errors.push(format!(
                "target agents must not be empty for {} propagation",
                options.propagation_type.as_str()
            ));
        }
        if options.propagation_type == PropagationType::Filtered && options.filter.is_none() {
            errors.push("filtered propagation requires a filter".to_string());
        }
        if !errors.is_empty() {
            warn!(slice = %slice.id, ?errors, "Context propagation rejected");
            return PropagationResult::failed(&slice.id, errors);
        }

        let recipients = self.resolve_recipients(slice, target_agents, options).await;

        self.store.insert(slice.clone());

        let payload = json!({
            "slice": slice,
            "targetAgents": recipients,
            "propagationType": options.propagation_type.as_str(),
        });
        let draft = EventDraft::new(
            EventKind::ContextPropagate.as_str(),
            payload,
            options.source_agent.clone(),
        )
        .with_targets(recipients.clone())
        .with_context(slice.id.clone());

        let (validation, event) = self.bus.publish_event(draft).await;
        let Some(event) = event else {
            return PropagationResult::failed(&slice.id, validation.errors);
        };

        info!(
            slice = %slice.id,
            mode = options.propagation_type.as_str(),
            recipients = recipients.len(),
            "Context propagated"
        );
        self.bus
            .observability()
            .record(
                TraceEvent::new(
                    TraceKind::ContextPropagated,
                    format!(
                        "Slice '{}' propagated ({}) to {} agent(s)",
                        slice.id,
                        options.propagation_type.as_str(),
                        recipients.len()
                    ),
                )
                .with_trace_id(event.trace_id)
                .with_correlation(event.correlation_id.clone()),
            )
            .await;

        PropagationResult {
            success: true,
            slice_id: slice.id.clone(),
            delivered_to: recipients,
            errors: Vec::new(),
            trace_id: Some(event.trace_id),
        }
    }

    async fn resolve_recipients(
        &self,
        slice: &ContextSlice,
        target_agents: &[String],
        options: &PropagationOptions,
    ) -> Vec<String> {
        let mut recipients: Vec<String> = Vec::new();
        let candidates: Vec<String> = match options.propagation_type {
            PropagationType::Broadcast => self.bus.subscribed_agents().await,
            _ => target_agents.to_vec(),
        };

        for agent in candidates {
            if recipients.contains(&agent) {
                continue;
            }
            let accepted = match (&options.propagation_type, &options.filter) {
                (PropagationType::Filtered, Some(filter)) => filter(&agent, slice),
                _ => true,
            };
            if accepted {
                recipients.push(agent);
            }
        }
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    #[test]
    fn test_create_applies_defaults() {
        let store = ContextStore::default();
        let slice = store.create(ContextSliceData::new("ctx-1")).unwrap();

        assert_eq!(slice.ttl_ms, DEFAULT_CONTEXT_TTL_MS);
        assert_eq!(slice.priority, Priority::Medium);
        assert_eq!(store.get("ctx-1"), Some(slice));
    }

    #[test]
    fn test_create_requires_id() {
        let store = ContextStore::default();

        let missing = store.create(ContextSliceData::default()).unwrap_err();
        assert!(matches!(missing, MeshError::InvalidContext(_)));

        let blank = store.create(ContextSliceData::new("  ")).unwrap_err();
        assert!(matches!(blank, MeshError::InvalidContext(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_last_write_wins_by_creation_time() {
        let store = ContextStore::default();
        let older = store
            .build(ContextSliceData::new("ctx").with_domain("old"))
            .unwrap();
        let newer = ContextSlice {
            domain: Some("new".to_string()),
            created_at: older.created_at + chrono::Duration::milliseconds(5),
            ..older.clone()
        };

        assert!(store.insert(newer));
        assert!(!store.insert(older));
        assert_eq!(
            store.get("ctx").and_then(|s| s.domain),
            Some("new".to_string())
        );
    }

    #[test]
    fn test_equal_creation_time_later_write_wins() {
        let store = ContextStore::default();
        let first = store
            .build(ContextSliceData::new("ctx").with_domain("first"))
            .unwrap();
        let second = ContextSlice {
            domain: Some("second".to_string()),
            ..first.clone()
        };

        assert!(store.insert(first));
        assert!(store.insert(second));
        assert_eq!(
            store.get("ctx").and_then(|s| s.domain),
            Some("second".to_string())
        );
    }

    #[test]
    fn test_purge_expired() {
        let store = ContextStore::default();
        let mut stale = store.build(ContextSliceData::new("stale")).unwrap();
        stale.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert(stale);
        store.create(ContextSliceData::new("fresh")).unwrap();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_out_of_range_ttl_keeps_slice() {
        let store = ContextStore::default();
        store
            .create(ContextSliceData {
                ttl_ms: Some(i64::MAX as u64),
                ..ContextSliceData::new("long")
            })
            .unwrap();
        store
            .create(ContextSliceData {
                ttl_ms: Some(u64::MAX),
                ..ContextSliceData::new("longer")
            })
            .unwrap();

        assert!(store.get("long").is_some());
        assert!(store.get("longer").is_some());
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_expired_read_removes_slice() {
        let store = ContextStore::default();
        let mut stale = store.build(ContextSliceData::new("stale")).unwrap();
        stale.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert(stale);

        assert_eq!(store.len(), 1);
        assert!(store.get("stale").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let store = Arc::new(ContextStore::default());
        store
            .create(ContextSliceData::new("short").with_ttl(Duration::from_millis(20)))
            .unwrap();

        let sweeper = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_targeted_propagation_requires_targets() {
        let propagator = ContextPropagator::new(
            Arc::new(ContextStore::default()),
            Arc::new(EventBus::default()),
        );
        let slice = propagator
            .store()
            .build(ContextSliceData::new("ctx"))
            .unwrap();

        let result = propagator
            .propagate(&slice, &[], &PropagationOptions::targeted())
            .await;

        assert!(!result.success);
        assert!(result.delivered_to.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(propagator.store().get("ctx").is_none());
    }

    #[tokio::test]
    async fn test_filtered_propagation_applies_predicate() {
        let propagator = ContextPropagator::new(
            Arc::new(ContextStore::default()),
            Arc::new(EventBus::default()),
        );
        let slice = propagator
            .store()
            .build(ContextSliceData::new("ctx").with_domain("networking"))
            .unwrap();
        let targets = vec!["net-1".to_string(), "kb-1".to_string()];

        let result = propagator
            .propagate(
                &slice,
                &targets,
                &PropagationOptions::filtered(|agent, slice| {
                    agent.starts_with("net") && slice.domain.as_deref() == Some("networking")
                }),
            )
            .await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.delivered_to, vec!["net-1"]);
        assert!(result.trace_id.is_some());
        assert!(propagator.store().get("ctx").is_some());
    }
}
