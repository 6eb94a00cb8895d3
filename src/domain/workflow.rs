//! Workflow runtime state and reconstruction from traces.
//!
//! A `WorkflowRecord` represents one execution of a workflow spec. The
//! orchestrator is the only writer; everyone else sees clones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::trace::{TraceEvent, TraceKind};

/// Runtime state of a submitted workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    /// Workflow id from the submitted spec
    pub id: String,

    /// Current state of the workflow
    pub state: WorkflowState,

    /// Per-step state, keyed by step id
    pub steps: BTreeMap<String, StepRecord>,

    /// When the workflow was accepted
    pub submitted_at: DateTime<Utc>,

    /// When the workflow reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    /// Create a pending record with every step pending
    pub fn new<I, S>(id: impl Into<String>, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            state: WorkflowState::Pending,
            steps: step_ids
                .into_iter()
                .map(|s| (s.into(), StepRecord::default()))
                .collect(),
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Reconstruct a record by replaying its traces in order.
    ///
    /// A resubmitted workflow id replays only its latest run.
    pub fn from_traces(traces: &[TraceEvent]) -> Option<Self> {
        let start = traces
            .iter()
            .rposition(|t| t.kind == TraceKind::WorkflowSubmitted)?;
        let first = &traces[start];
        let workflow_id = first.workflow_id.clone()?;

        let step_ids: Vec<String> = first
            .output
            .as_ref()
            .and_then(|o| o.get("steps"))
            .and_then(|s| s.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut record = Self::new(workflow_id.clone(), step_ids);
        record.submitted_at = first.timestamp;

        for trace in traces[start..]
            .iter()
            .filter(|t| t.workflow_id.as_deref() == Some(workflow_id.as_str()))
        {
            record.apply_trace(trace);
        }

        Some(record)
    }

    /// Apply a single trace to update the record.
    ///
    /// Once the workflow is terminal, further traces are ignored.
    pub fn apply_trace(&mut self, trace: &TraceEvent) {
        if self.is_finished() {
            return;
        }

        match trace.kind {
            TraceKind::WorkflowSubmitted => {
                self.state = WorkflowState::Pending;
                self.submitted_at = trace.timestamp;
            }
            TraceKind::WorkflowStarted => {
                self.state = WorkflowState::Running;
            }
            TraceKind::WorkflowCompleted => {
                self.finish(WorkflowState::Completed, trace.timestamp);
            }
            TraceKind::WorkflowFailed => {
                self.finish(WorkflowState::Failed, trace.timestamp);
            }
            TraceKind::WorkflowTimedOut => {
                self.finish(WorkflowState::TimedOut, trace.timestamp);
            }
            TraceKind::StepReady => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Ready;
                }
            }
            TraceKind::StepDispatched => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Running;
                    step.attempts = trace.attempt.unwrap_or(step.attempts + 1);
                    step.started_at.get_or_insert(trace.timestamp);
                }
            }
            TraceKind::StepRetrying => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Running;
                    step.last_error = trace.failure.clone();
                }
            }
            TraceKind::StepCompleted => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Completed;
                    step.output = trace.output.clone();
                    step.finished_at = Some(trace.timestamp);
                }
            }
            TraceKind::StepFailed => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Failed;
                    step.last_error = trace.failure.clone();
                    step.failure = trace.failure.clone();
                    step.finished_at = Some(trace.timestamp);
                }
            }
            TraceKind::StepCancelled => {
                if let Some(step) = self.step_for(trace) {
                    step.state = StepState::Cancelled;
                    step.finished_at = Some(trace.timestamp);
                }
            }
            TraceKind::EventRejected
            | TraceKind::DuplicateDropped
            | TraceKind::HandlerFailed
            | TraceKind::ContextPropagated => {}
        }
    }

    fn step_for(&mut self, trace: &TraceEvent) -> Option<&mut StepRecord> {
        let step_id = trace.step_id.as_ref()?;
        Some(self.steps.entry(step_id.clone()).or_default())
    }

    fn finish(&mut self, state: WorkflowState, at: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(at);
    }

    /// Check if the workflow reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Get the state of a step
    pub fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.steps.get(step_id).map(|s| s.state)
    }

    /// Check if every step completed
    pub fn all_steps_completed(&self) -> bool {
        self.steps.values().all(|s| s.state == StepState::Completed)
    }
}

/// Runtime state of one step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub state: StepState,

    /// Number of attempts dispatched so far
    pub attempts: u32,

    /// Terminal failure, if the step failed
    pub failure: Option<StepFailure>,

    /// Most recent attempt failure, including retried ones
    pub last_error: Option<StepFailure>,

    /// Output reported by the agent on completion
    pub output: Option<serde_json::Value>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// State of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowState {
    /// Accepted, scheduler not yet started
    Pending,

    /// Scheduler is dispatching steps
    Running,

    /// Every step completed
    Completed,

    /// At least one step failed
    Failed,

    /// Workflow deadline elapsed first
    TimedOut,
}

impl WorkflowState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::TimedOut => "timedOut",
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Pending
    }
}

/// State of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepState {
    /// Waiting on dependencies
    Pending,

    /// Dependencies completed, waiting for a dispatch slot
    Ready,

    /// Dispatched (or backing off between attempts)
    Running,

    /// Completed successfully
    Completed,

    /// Failed terminally
    Failed,

    /// Abandoned by a workflow timeout
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled
        )
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StepFailure {
    /// The agent reported a failure
    HandlerError { message: String },

    /// No completion arrived within the step timeout
    StepTimeout,

    /// A dependency failed terminally; the step never ran
    UpstreamFailure { upstream: String },

    /// The dispatch event itself failed validation
    DispatchRejected { errors: Vec<String> },
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::HandlerError { message } => write!(f, "handler error: {}", message),
            StepFailure::StepTimeout => f.write_str("step timeout"),
            StepFailure::UpstreamFailure { upstream } => {
                write!(f, "upstream step '{}' failed", upstream)
            }
            StepFailure::DispatchRejected { errors } => {
                write!(f, "dispatch rejected: {}", errors.join("; "))
            }
        }
    }
}
