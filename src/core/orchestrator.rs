//! Workflow orchestrator - the DAG execution engine.
//!
//! Each submitted workflow is driven by one scheduler task. Ready steps are
//! dispatched over the bus as `workflow.step.dispatch` events targeted at the
//! step's agent; the agent answers with `workflow.step.completed` or
//! `workflow.step.failed` carrying the dispatch's correlation id, which
//! resolves a completion future the step's attempt loop is waiting on.
//!
//! Every state change is a `TraceEvent` applied to the workflow's record and
//! recorded by the observability sink, so a record can be rebuilt from its
//! traces.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Agent, AgentStatus, Event, EventDraft, EventKind, StepFailure, StepState, TraceEvent,
    TraceKind, WorkflowRecord, WorkflowState,
};
use crate::error::{MeshError, MeshResult};

use super::bus::{handler_fn, EventBus};
use super::dag::StepGraph;
use super::fingerprint::step_fingerprint;
use super::workflow::{RetryPolicy, StepSpec, WorkflowSpec};

/// Agent id the orchestrator publishes and subscribes as
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

/// Scheduler limits and defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Steps of one workflow running at the same time
    pub max_concurrency: usize,
    /// Per-attempt timeout for steps without their own
    pub default_step_timeout: Duration,
    /// Deadline for workflows without their own
    pub default_workflow_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_step_timeout: Duration::from_secs(30),
            default_workflow_timeout: Duration::from_secs(300),
        }
    }
}

/// Answer to a workflow submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSubmission {
    pub success: bool,
    pub workflow_id: String,
    pub status: WorkflowState,
}

/// What an agent reported for one attempt
#[derive(Debug)]
enum StepReport {
    Completed(Value),
    Failed(String),
}

/// A dispatched attempt waiting for its completion event
struct PendingCompletion {
    workflow_id: String,
    step_id: String,
    tx: oneshot::Sender<StepReport>,
}

type StepResult = (String, Result<(), StepFailure>);

/// Drives submitted workflows over the event bus
pub struct WorkflowOrchestrator {
    bus: Arc<EventBus>,
    settings: OrchestratorSettings,
    workflows: DashMap<String, watch::Sender<WorkflowRecord>>,
    pending: DashMap<String, PendingCompletion>,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator. Call `start` before submitting workflows.
    pub fn new(bus: Arc<EventBus>, settings: OrchestratorSettings) -> Arc<Self> {
        Arc::new(Self {
            bus,
            settings: OrchestratorSettings {
                max_concurrency: settings.max_concurrency.max(1),
                ..settings
            },
            workflows: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Register the orchestrator agent and subscribe its completion and
    /// submission listeners.
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        let agent = Agent::new(ORCHESTRATOR_AGENT, "orchestrator").with_status(AgentStatus::Ready);
        match self.bus.register_agent(agent).await {
            Ok(()) | Err(MeshError::AgentAlreadyRegistered(_)) => {}
            Err(e) => return Err(e),
        }

        for kind in [EventKind::StepCompleted, EventKind::StepFailed] {
            let orchestrator: Weak<Self> = Arc::downgrade(self);
            self.bus
                .subscribe(
                    ORCHESTRATOR_AGENT,
                    kind.as_str(),
                    handler_fn(move |event| {
                        let orchestrator = orchestrator.clone();
                        async move {
                            if let Some(orchestrator) = orchestrator.upgrade() {
                                orchestrator.resolve_completion(&event);
                            }
                            Ok(())
                        }
                    }),
                )
                .await;
        }

        let orchestrator: Weak<Self> = Arc::downgrade(self);
        self.bus
            .subscribe(
                ORCHESTRATOR_AGENT,
                EventKind::WorkflowOrchestrate.as_str(),
                handler_fn(move |event| {
                    let orchestrator = orchestrator.clone();
                    async move {
                        match orchestrator.upgrade() {
                            Some(orchestrator) => orchestrator.submit_from_event(&event).await,
                            None => Ok(()),
                        }
                    }
                }),
            )
            .await;

        info!("Workflow orchestrator started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Validate a workflow, record it and start its scheduler.
    ///
    /// Structural problems are rejected before any step is dispatched.
    #[instrument(skip(self, spec), fields(workflow = %spec.id))]
    pub async fn submit_workflow(self: &Arc<Self>, spec: WorkflowSpec) -> MeshResult<WorkflowSubmission> {
        let graph = spec.validate()?;

        let record = WorkflowRecord::new(spec.id.clone(), graph.steps().iter().cloned());
        let (tx, _rx) = watch::channel(record);
        match self.workflows.entry(spec.id.clone()) {
            Entry::Occupied(entry) if !entry.get().borrow().is_finished() => {
                return Err(MeshError::WorkflowAlreadyActive(spec.id.clone()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(tx);
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        info!(steps = graph.len(), "Workflow submitted");
        self.transition(
            TraceEvent::workflow(
                TraceKind::WorkflowSubmitted,
                &spec.id,
                format!("Workflow '{}' submitted with {} step(s)", spec.id, graph.len()),
            )
            .with_output(json!({ "steps": graph.topological_order() })),
        )
        .await;

        self.set_workflow_state(&spec.id, TraceKind::WorkflowStarted, "Workflow started".to_string())
            .await;

        let workflow_id = spec.id.clone();
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_workflow(spec, graph).await;
        });

        Ok(WorkflowSubmission {
            success: true,
            workflow_id,
            status: WorkflowState::Running,
        })
    }

    /// Submit the `dagSpec` of a `workflow.orchestrate` event
    async fn submit_from_event(self: &Arc<Self>, event: &Event) -> anyhow::Result<()> {
        let workflow_id = event
            .payload_str("workflowId")
            .ok_or_else(|| anyhow::anyhow!("workflow.orchestrate without workflowId"))?
            .to_string();

        let mut dag = event.payload.get("dagSpec").cloned().unwrap_or(Value::Null);
        if let Some(map) = dag.as_object_mut() {
            map.entry("id")
                .or_insert_with(|| Value::String(workflow_id.clone()));
        }

        let spec = WorkflowSpec::from_value(dag)?;
        let submission = self.submit_workflow(spec).await?;
        debug!(workflow = %submission.workflow_id, source = %event.source_agent, "Workflow submitted over the bus");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion intake
    // ------------------------------------------------------------------

    /// Resolve the completion future of a dispatched attempt.
    ///
    /// Unknown correlation ids (late, duplicate or foreign completions) are
    /// ignored.
    fn resolve_completion(&self, event: &Event) {
        let workflow_id = event.payload_str("workflowId").unwrap_or_default();
        let step_id = event.payload_str("stepId").unwrap_or_default();

        let Some((_, pending)) = self.pending.remove_if(&event.correlation_id, |_, p| {
            p.workflow_id == workflow_id && p.step_id == step_id
        }) else {
            debug!(
                correlation = %event.correlation_id,
                workflow = %workflow_id,
                step = %step_id,
                "Ignoring completion with no pending attempt"
            );
            return;
        };

        let report = match event.event_type {
            EventKind::StepCompleted => {
                StepReport::Completed(event.payload.get("output").cloned().unwrap_or(Value::Null))
            }
            _ => StepReport::Failed(
                event
                    .payload_str("error")
                    .unwrap_or("unspecified error")
                    .to_string(),
            ),
        };

        // The attempt loop may have timed out in the meantime
        let _ = pending.tx.send(report);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    async fn run_workflow(self: Arc<Self>, spec: WorkflowSpec, graph: StepGraph) {
        let workflow_id = spec.id.clone();
        let run_key = format!("{}@{}", workflow_id, Uuid::new_v4().simple());
        let steps: HashMap<&str, &StepSpec> = spec.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let position: HashMap<&str, usize> = graph
            .topological_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut waiting_on: HashMap<&str, usize> = graph
            .steps()
            .iter()
            .map(|id| (id.as_str(), graph.dependencies(id).len()))
            .collect();

        // Keyed by topological position so ready steps dispatch in order
        let mut ready: BTreeMap<usize, String> = BTreeMap::new();
        for root in graph.roots() {
            self.mark_ready(&workflow_id, &root).await;
            ready.insert(position[root.as_str()], root);
        }

        let deadline = tokio::time::sleep(spec.timeout(self.settings.default_workflow_timeout));
        tokio::pin!(deadline);

        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < self.settings.max_concurrency {
                let Some((_, step_id)) = ready.pop_first() else {
                    break;
                };
                let Some(step) = steps.get(step_id.as_str()) else {
                    continue;
                };
                let policy = step.retry_policy(&spec.retry_policy).clone();
                let timeout = step.timeout(self.settings.default_step_timeout);
                running.push(Arc::clone(&self).run_step(
                    workflow_id.clone(),
                    run_key.clone(),
                    (*step).clone(),
                    policy,
                    timeout,
                ));
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut deadline => {
                    drop(running);
                    self.time_out(&workflow_id).await;
                    return;
                }
                Some((step_id, result)) = running.next() => {
                    match result {
                        Ok(()) => {
                            for child in graph.dependents(&step_id) {
                                let Some(remaining) = waiting_on.get_mut(child.as_str()) else {
                                    continue;
                                };
                                *remaining = remaining.saturating_sub(1);
                                if *remaining == 0 && self.step_state(&workflow_id, child) == Some(StepState::Pending) {
                                    self.mark_ready(&workflow_id, child).await;
                                    ready.insert(position[child.as_str()], child.clone());
                                }
                            }
                        }
                        Err(_) => {
                            self.fail_dependents(&workflow_id, &graph, &step_id).await;
                        }
                    }
                }
            }
        }

        let all_completed = self
            .workflow_status(&workflow_id)
            .map(|r| r.all_steps_completed())
            .unwrap_or(false);

        if all_completed {
            info!(workflow = %workflow_id, "Workflow completed");
            self.set_workflow_state(&workflow_id, TraceKind::WorkflowCompleted, "Workflow completed".to_string())
                .await;
        } else {
            warn!(workflow = %workflow_id, "Workflow failed");
            self.set_workflow_state(&workflow_id, TraceKind::WorkflowFailed, "Workflow failed".to_string())
                .await;
        }
    }

    /// Dispatch a step until it completes or its retry policy is exhausted
    async fn run_step(
        self: Arc<Self>,
        workflow_id: String,
        run_key: String,
        step: StepSpec,
        policy: RetryPolicy,
        step_timeout: Duration,
    ) -> StepResult {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let correlation_id = Uuid::new_v4().to_string();

            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                correlation_id.clone(),
                PendingCompletion {
                    workflow_id: workflow_id.clone(),
                    step_id: step.id.clone(),
                    tx,
                },
            );

            self.transition(
                TraceEvent::step(
                    TraceKind::StepDispatched,
                    &workflow_id,
                    &step.id,
                    format!("Step '{}' dispatched to '{}' (attempt {})", step.id, step.agent_id, attempt),
                )
                .with_attempt(attempt)
                .with_correlation(correlation_id.clone()),
            )
            .await;

            let draft = EventDraft::new(
                EventKind::StepDispatch.as_str(),
                json!({
                    "workflowId": workflow_id,
                    "stepId": step.id,
                    "agentId": step.agent_id,
                    "action": step.action,
                    "parameters": step.parameters,
                    "attempt": attempt,
                }),
                ORCHESTRATOR_AGENT,
            )
            .with_targets(vec![step.agent_id.clone()])
            .with_correlation(correlation_id.clone())
            .with_fingerprint(step_fingerprint(&run_key, &step.id, attempt, &step.parameters));

            // Delivery runs on its own task: handlers see the dispatch even if
            // this attempt times out or the workflow deadline drops it.
            let bus = Arc::clone(&self.bus);
            let dispatch = tokio::spawn(async move { bus.publish_event(draft).await });

            let outcome = tokio::time::timeout(step_timeout, async {
                match dispatch.await {
                    Ok((_, Some(_))) => rx.await.map_err(|_| StepFailure::HandlerError {
                        message: "completion channel closed".to_string(),
                    }),
                    Ok((validation, None)) => {
                        let mut errors = validation.errors;
                        errors.extend(validation.warnings);
                        Err(StepFailure::DispatchRejected { errors })
                    }
                    Err(e) => Err(StepFailure::HandlerError {
                        message: format!("dispatch task failed: {}", e),
                    }),
                }
            })
            .await;

            let failure = match outcome {
                Ok(Ok(StepReport::Completed(output))) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(workflow = %workflow_id, step = %step.id, attempt, duration_ms, "Step completed");
                    self.transition(
                        TraceEvent::step(
                            TraceKind::StepCompleted,
                            &workflow_id,
                            &step.id,
                            format!("Step '{}' completed in {}ms", step.id, duration_ms),
                        )
                        .with_attempt(attempt)
                        .with_correlation(correlation_id)
                        .with_duration(duration_ms)
                        .with_output(output),
                    )
                    .await;
                    return (step.id, Ok(()));
                }
                Ok(Ok(StepReport::Failed(message))) => StepFailure::HandlerError { message },
                Ok(Err(failure)) => {
                    self.pending.remove(&correlation_id);
                    failure
                }
                Err(_) => {
                    self.pending.remove(&correlation_id);
                    StepFailure::StepTimeout
                }
            };

            let duration_ms = started.elapsed().as_millis() as u64;

            if policy.should_retry(attempt) {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    workflow = %workflow_id,
                    step = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Step failed, retrying"
                );
                self.transition(
                    TraceEvent::step(
                        TraceKind::StepRetrying,
                        &workflow_id,
                        &step.id,
                        format!("Step '{}' failed, retrying in {:?}: {}", step.id, delay, failure),
                    )
                    .with_attempt(attempt)
                    .with_duration(duration_ms)
                    .with_failure(failure),
                )
                .await;

                tokio::time::sleep(delay).await;
                continue;
            }

            error!(
                workflow = %workflow_id,
                step = %step.id,
                attempt,
                error = %failure,
                "Step failed permanently"
            );
            self.transition(
                TraceEvent::step(
                    TraceKind::StepFailed,
                    &workflow_id,
                    &step.id,
                    format!("Step '{}' failed after {} attempt(s): {}", step.id, attempt, failure),
                )
                .with_attempt(attempt)
                .with_duration(duration_ms)
                .with_failure(failure.clone()),
            )
            .await;

            return (step.id, Err(failure));
        }
    }

    async fn mark_ready(&self, workflow_id: &str, step_id: &str) {
        self.transition(TraceEvent::step(
            TraceKind::StepReady,
            workflow_id,
            step_id,
            format!("Step '{}' ready", step_id),
        ))
        .await;
    }

    /// Fail every not-yet-started step downstream of a failed one
    async fn fail_dependents(&self, workflow_id: &str, graph: &StepGraph, failed: &str) {
        for dependent in graph.transitive_dependents(failed) {
            let state = self.step_state(workflow_id, &dependent);
            if !matches!(state, Some(StepState::Pending) | Some(StepState::Ready)) {
                continue;
            }
            debug!(workflow = %workflow_id, step = %dependent, upstream = %failed, "Skipping step after upstream failure");
            self.transition(
                TraceEvent::step(
                    TraceKind::StepFailed,
                    workflow_id,
                    &dependent,
                    format!("Step '{}' skipped: upstream '{}' failed", dependent, failed),
                )
                .with_failure(StepFailure::UpstreamFailure {
                    upstream: failed.to_string(),
                }),
            )
            .await;
        }
    }

    /// Cancel running steps, drop their completion futures and mark the
    /// workflow timed out. Late completions then find nothing to resolve.
    async fn time_out(&self, workflow_id: &str) {
        self.pending.retain(|_, p| p.workflow_id != workflow_id);

        let running: Vec<String> = self
            .workflow_status(workflow_id)
            .map(|r| {
                r.steps
                    .iter()
                    .filter(|(_, s)| s.state == StepState::Running)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        for step_id in &running {
            self.transition(TraceEvent::step(
                TraceKind::StepCancelled,
                workflow_id,
                step_id,
                format!("Step '{}' cancelled by workflow timeout", step_id),
            ))
            .await;
        }

        warn!(workflow = %workflow_id, cancelled = running.len(), "Workflow timed out");
        self.set_workflow_state(
            workflow_id,
            TraceKind::WorkflowTimedOut,
            format!("Workflow timed out, {} running step(s) cancelled", running.len()),
        )
        .await;
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Apply a trace to the workflow record and hand it to the sink
    async fn transition(&self, trace: TraceEvent) {
        if let Some(workflow_id) = trace.workflow_id.as_deref() {
            if let Some(record) = self.workflows.get(workflow_id) {
                record.send_modify(|r| r.apply_trace(&trace));
            }
        }
        self.bus.observability().record(trace).await;
    }

    /// Record a workflow-level transition and announce it on the bus
    async fn set_workflow_state(&self, workflow_id: &str, kind: TraceKind, summary: String) {
        self.transition(TraceEvent::workflow(kind, workflow_id, summary))
            .await;

        if let Some(record) = self.workflow_status(workflow_id) {
            self.bus
                .publish(
                    EventKind::WorkflowStateChanged.as_str(),
                    json!({
                        "workflowId": workflow_id,
                        "state": record.state.as_str(),
                    }),
                    ORCHESTRATOR_AGENT,
                )
                .await;
        }
    }

    fn step_state(&self, workflow_id: &str, step_id: &str) -> Option<StepState> {
        self.workflows
            .get(workflow_id)
            .and_then(|record| record.borrow().step_state(step_id))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of a workflow's state
    pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.workflows
            .get(workflow_id)
            .map(|record| record.borrow().clone())
    }

    /// Wait until the workflow reaches a terminal state
    pub async fn wait_for_completion(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        let mut rx = self.workflows.get(workflow_id)?.subscribe();

        let finished = rx
            .wait_for(|record| record.is_finished())
            .await
            .map(|record| record.clone());

        // The record was replaced by a resubmission; report what we last saw
        Some(finished.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// All known workflows, most recently submitted first
    pub fn list_workflows(&self) -> Vec<WorkflowRecord> {
        let mut workflows: Vec<WorkflowRecord> = self
            .workflows
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        workflows.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        workflows
    }

    /// Rebuild a workflow record from the traces retained by the sink
    pub async fn replay_workflow(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        let traces = self.bus.observability().workflow_traces(workflow_id).await;
        WorkflowRecord::from_traces(&traces)
    }

    /// Attempts still waiting for a completion event
    pub fn pending_completions(&self) -> usize {
        self.pending.len()
    }
}
