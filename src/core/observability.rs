//! Observability sink: validation statistics, transition traces and agent
//! interactions.
//!
//! All writes go through the sink's own lock; readers get snapshots.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::TraceEvent;

use super::validator::ValidationResult;

/// Default number of traces and interactions retained
pub const DEFAULT_RETENTION: usize = 1000;

/// Aggregate validation statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub total_events: u64,
    pub valid_events: u64,
    pub invalid_events: u64,

    /// `valid_events / total_events`, 1.0 when nothing was validated
    pub success_rate: f64,

    /// Error message -> occurrences
    pub error_histogram: BTreeMap<String, u64>,

    /// Raw event type -> validations
    pub events_by_type: BTreeMap<String, u64>,

    /// Valid events dropped because their fingerprint was already delivered
    pub duplicates_dropped: u64,

    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
}

/// One delivery of an event from one agent to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub from_agent: String,
    pub to_agent: String,
    pub event_type: String,
    pub trace_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: InteractionOutcome,
}

impl Interaction {
    pub fn involves(&self, agent_id: &str) -> bool {
        self.from_agent == agent_id || self.to_agent == agent_id
    }
}

/// Result of handing an event to a handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum InteractionOutcome {
    Delivered,
    Failed { error: String },
}

#[derive(Debug, Default)]
struct SinkState {
    stats: ValidationStats,
    traces: VecDeque<TraceEvent>,
    interactions: VecDeque<Interaction>,
}

/// Aggregates traces and statistics for external consumption
#[derive(Debug)]
pub struct ObservabilitySink {
    state: RwLock<SinkState>,
    retention: usize,
}

impl Default for ObservabilitySink {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ObservabilitySink {
    /// Create a sink keeping at most `retention` traces and interactions
    pub fn new(retention: usize) -> Self {
        Self {
            state: RwLock::new(SinkState::default()),
            retention: retention.max(1),
        }
    }

    /// Count one validation outcome
    pub async fn record_validation(&self, event_type: &str, result: &ValidationResult) {
        let mut state = self.state.write().await;
        let stats = &mut state.stats;

        stats.total_events += 1;
        if result.valid {
            stats.valid_events += 1;
        } else {
            stats.invalid_events += 1;
            for error in &result.errors {
                *stats.error_histogram.entry(error.clone()).or_insert(0) += 1;
            }
        }
        *stats.events_by_type.entry(event_type.to_string()).or_insert(0) += 1;
        stats.success_rate = stats.valid_events as f64 / stats.total_events as f64;
    }

    pub async fn record_duplicate(&self) {
        self.state.write().await.stats.duplicates_dropped += 1;
    }

    /// Record a transition
    pub async fn record(&self, trace: TraceEvent) {
        debug!(kind = ?trace.kind, workflow = ?trace.workflow_id, step = ?trace.step_id, "{}", trace.summary);

        let mut state = self.state.write().await;
        if state.traces.len() >= self.retention {
            state.traces.pop_front();
        }
        state.traces.push_back(trace);
    }

    /// Record a handler delivery
    pub async fn record_interaction(&self, interaction: Interaction) {
        let mut state = self.state.write().await;
        if matches!(interaction.outcome, InteractionOutcome::Failed { .. }) {
            state.stats.handler_failures += 1;
        }
        if state.interactions.len() >= self.retention {
            state.interactions.pop_front();
        }
        state.interactions.push_back(interaction);
    }

    /// Snapshot of the validation statistics
    pub async fn validation_stats(&self) -> ValidationStats {
        let stats = self.state.read().await.stats.clone();
        if stats.total_events == 0 {
            return ValidationStats {
                success_rate: 1.0,
                ..stats
            };
        }
        stats
    }

    /// Most recent `limit` traces, oldest first
    pub async fn traces(&self, limit: usize) -> Vec<TraceEvent> {
        let state = self.state.read().await;
        let skip = state.traces.len().saturating_sub(limit);
        state.traces.iter().skip(skip).cloned().collect()
    }

    /// Every retained trace of one workflow, in order
    pub async fn workflow_traces(&self, workflow_id: &str) -> Vec<TraceEvent> {
        self.state
            .read()
            .await
            .traces
            .iter()
            .filter(|t| t.workflow_id.as_deref() == Some(workflow_id))
            .cloned()
            .collect()
    }

    /// Interactions where the agent was sender or receiver
    pub async fn agent_interactions(&self, agent_id: &str) -> Vec<Interaction> {
        self.state
            .read()
            .await
            .interactions
            .iter()
            .filter(|i| i.involves(agent_id))
            .cloned()
            .collect()
    }
}
