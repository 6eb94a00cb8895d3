//! Context slices shared between agents.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default slice lifetime in milliseconds
pub const DEFAULT_CONTEXT_TTL_MS: u64 = 30_000;

/// A small, TTL-bounded bundle of shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSlice {
    /// Unique, non-empty identifier
    pub id: String,

    pub user_id: Option<String>,
    pub session_id: Option<String>,

    /// Domain tag used by filtered propagation
    pub domain: Option<String>,

    /// Opaque state carried by the slice
    pub state: Option<Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Lifetime from `created_at`, in milliseconds
    pub ttl_ms: u64,

    pub priority: Priority,

    /// Creation time; decides which of two same-id slices wins
    pub created_at: DateTime<Utc>,
}

impl ContextSlice {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// When the slice stops being visible.
    ///
    /// TTLs past the representable range saturate to the latest instant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Look up a metadata value
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Input for creating a context slice.
///
/// Every field is optional here; `id` is checked when the slice is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSliceData {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub domain: Option<String>,
    pub state: Option<Value>,
    pub metadata: Map<String, Value>,
    #[serde(alias = "ttl")]
    pub ttl_ms: Option<u64>,
    pub priority: Option<Priority>,
}

impl ContextSliceData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_session(mut self, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = Some(session_id.into());
        self
    }
}

/// Propagation priority of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}
