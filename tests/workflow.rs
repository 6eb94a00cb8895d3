//! Workflow Integration Tests
//!
//! End-to-end scheduling through the mesh: dependency ordering, retries,
//! timeouts, failure propagation and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_mesh::agents::{capability_fn, AgentCapability, StepRequest};
use agent_mesh::config::MeshConfig;
use agent_mesh::core::{handler_fn, AgentMesh, RetryPolicy, StepSpec, WorkflowSpec};
use agent_mesh::domain::{
    Agent, Event, EventDraft, EventKind, StepFailure, StepState, WorkflowRecord, WorkflowState,
};
use agent_mesh::MeshError;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    End,
}

type Log = Arc<Mutex<Vec<(String, Phase, Instant)>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn instant_of(log: &Log, step: &str, phase: Phase) -> Instant {
    log.lock()
        .unwrap()
        .iter()
        .find(|(s, p, _)| s == step && *p == phase)
        .map(|(_, _, at)| *at)
        .unwrap_or_else(|| panic!("no {:?} recorded for {}", phase, step))
}

fn starts(log: &Log, step: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(s, p, _)| s == step && *p == Phase::Start)
        .count()
}

/// Succeeds after `work`, recording start and end of every attempt
fn recording(log: Log, work: Duration) -> Arc<dyn AgentCapability> {
    capability_fn(move |event: Event| {
        let log = Arc::clone(&log);
        async move {
            let request = StepRequest::from_event(&event)?;
            log.lock()
                .unwrap()
                .push((request.step_id.clone(), Phase::Start, Instant::now()));
            tokio::time::sleep(work).await;
            log.lock()
                .unwrap()
                .push((request.step_id.clone(), Phase::End, Instant::now()));
            Ok(json!({ "step": request.step_id }))
        }
    })
}

/// Fails every attempt, recording when each one started
fn failing(log: Log) -> Arc<dyn AgentCapability> {
    capability_fn(move |event: Event| {
        let log = Arc::clone(&log);
        async move {
            let request = StepRequest::from_event(&event)?;
            log.lock()
                .unwrap()
                .push((request.step_id.clone(), Phase::Start, Instant::now()));
            Err::<Value, anyhow::Error>(anyhow::anyhow!("{} refused", request.action))
        }
    })
}

async fn mesh_with(max_concurrency: usize) -> AgentMesh {
    AgentMesh::new(MeshConfig {
        max_concurrency,
        ..MeshConfig::default()
    })
    .await
    .unwrap()
}

async fn finish(mesh: &AgentMesh, workflow_id: &str) -> WorkflowRecord {
    tokio::time::timeout(Duration::from_secs(10), mesh.wait_for_completion(workflow_id))
        .await
        .expect("workflow did not reach a terminal state")
        .expect("workflow not found")
}

fn quick_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(10))
}

#[tokio::test]
async fn test_two_step_workflow_completes_in_order() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("a", "validator"), recording(log.clone(), Duration::from_millis(30)))
        .await
        .unwrap();
    mesh.attach_capability(Agent::new("b", "planner"), recording(log.clone(), Duration::from_millis(5)))
        .await
        .unwrap();

    let spec = WorkflowSpec::from_json(
        r#"{
            "id": "wf1",
            "steps": [
                {"id": "s1", "agentId": "a", "action": "validate", "dependencies": []},
                {"id": "s2", "agentId": "b", "action": "plan", "dependencies": ["s1"]}
            ],
            "timeout": 5000
        }"#,
    )
    .unwrap();

    let submission = mesh.submit_workflow(spec).await.unwrap();
    assert!(submission.success);
    assert_eq!(submission.workflow_id, "wf1");

    let record = finish(&mesh, "wf1").await;

    assert_eq!(record.state, WorkflowState::Completed);
    assert!(record.all_steps_completed());
    assert!(instant_of(&log, "s2", Phase::Start) >= instant_of(&log, "s1", Phase::End));
    assert_eq!(record.steps["s1"].output, Some(json!({"step": "s1"})));
    assert_eq!(record.steps["s2"].attempts, 1);
}

#[tokio::test]
async fn test_linear_chain_respects_dependencies() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("worker", "worker"), recording(log.clone(), Duration::from_millis(15)))
        .await
        .unwrap();

    let spec = WorkflowSpec::new("chain")
        .step(StepSpec::new("c", "worker", "three").depends_on(["b"]))
        .step(StepSpec::new("a", "worker", "one"))
        .step(StepSpec::new("b", "worker", "two").depends_on(["a"]));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "chain").await;

    assert_eq!(record.state, WorkflowState::Completed);
    assert!(instant_of(&log, "b", Phase::Start) >= instant_of(&log, "a", Phase::End));
    assert!(instant_of(&log, "c", Phase::Start) >= instant_of(&log, "b", Phase::End));
}

#[tokio::test]
async fn test_failure_propagates_to_dependents_only() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("flaky", "worker"), failing(log.clone()))
        .await
        .unwrap();
    mesh.attach_capability(Agent::new("solid", "worker"), recording(log.clone(), Duration::from_millis(5)))
        .await
        .unwrap();

    let spec = WorkflowSpec::new("wf-fail")
        .with_retry_policy(quick_retries(2))
        .step(StepSpec::new("a", "flaky", "fetch"))
        .step(StepSpec::new("b", "solid", "use").depends_on(["a"]))
        .step(StepSpec::new("c", "solid", "use-more").depends_on(["b"]))
        .step(StepSpec::new("d", "solid", "independent"));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-fail").await;

    assert_eq!(record.state, WorkflowState::Failed);
    assert_eq!(record.step_state("a"), Some(StepState::Failed));
    assert_eq!(record.steps["a"].attempts, 2);
    assert!(matches!(
        record.steps["a"].failure,
        Some(StepFailure::HandlerError { ref message }) if message.contains("fetch refused")
    ));

    for dependent in ["b", "c"] {
        assert_eq!(record.step_state(dependent), Some(StepState::Failed));
        assert_eq!(
            record.steps[dependent].failure,
            Some(StepFailure::UpstreamFailure {
                upstream: "a".to_string()
            })
        );
        assert_eq!(record.steps[dependent].attempts, 0);
        assert_eq!(starts(&log, dependent), 0);
    }

    assert_eq!(record.step_state("d"), Some(StepState::Completed));
}

#[tokio::test]
async fn test_exponential_retry_attempts_and_backoff() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("flaky", "worker"), failing(log.clone()))
        .await
        .unwrap();

    let spec = WorkflowSpec::new("wf-retry")
        .with_retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(40),
            Duration::from_secs(1),
        ))
        .step(StepSpec::new("s", "flaky", "always-fails"));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-retry").await;

    assert_eq!(record.state, WorkflowState::Failed);
    assert_eq!(record.steps["s"].attempts, 3);
    assert_eq!(starts(&log, "s"), 3);

    let attempts: Vec<Instant> = log.lock().unwrap().iter().map(|(_, _, at)| *at).collect();
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap >= Duration::from_millis(40));
    assert!(second_gap >= first_gap);
}

#[tokio::test]
async fn test_step_timeout_is_retried_then_fails() {
    let mesh = mesh_with(8).await;
    mesh.attach_capability(
        Agent::new("slow", "worker"),
        capability_fn(|_event: Event| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }),
    )
    .await
    .unwrap();

    let spec = WorkflowSpec::new("wf-slow")
        .with_retry_policy(quick_retries(2))
        .step(StepSpec::new("s", "slow", "ponder").with_timeout(Duration::from_millis(50)));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-slow").await;

    assert_eq!(record.state, WorkflowState::Failed);
    assert_eq!(record.steps["s"].attempts, 2);
    assert_eq!(record.steps["s"].failure, Some(StepFailure::StepTimeout));
    assert_eq!(mesh.orchestrator().pending_completions(), 0);
}

#[tokio::test]
async fn test_step_timeout_covers_inline_handlers() {
    let mesh = mesh_with(8).await;
    mesh.register_agent(Agent::new("inline", "worker")).await.unwrap();

    // Does its work inside delivery, then reports under the dispatch correlation id
    let bus = Arc::downgrade(mesh.bus());
    mesh.subscribe(
        "inline",
        "workflow.step.dispatch",
        handler_fn(move |event: Event| {
            let bus = bus.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Some(bus) = bus.upgrade() {
                    bus.publish_draft(
                        EventDraft::new(
                            "workflow.step.completed",
                            json!({
                                "workflowId": event.payload["workflowId"],
                                "stepId": event.payload["stepId"],
                                "output": "too late",
                            }),
                            "inline",
                        )
                        .with_correlation(event.correlation_id.clone()),
                    )
                    .await;
                }
                Ok(())
            }
        }),
    )
    .await;

    let spec = WorkflowSpec::new("wf-inline")
        .with_retry_policy(RetryPolicy::none())
        .step(StepSpec::new("s", "inline", "ponder").with_timeout(Duration::from_millis(50)));

    let started = Instant::now();
    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-inline").await;

    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(record.state, WorkflowState::Failed);
    assert_eq!(record.steps["s"].attempts, 1);
    assert_eq!(record.steps["s"].failure, Some(StepFailure::StepTimeout));
    assert_eq!(mesh.orchestrator().pending_completions(), 0);
}

#[tokio::test]
async fn test_workflow_deadline_does_not_cut_off_delivery() {
    let mesh = mesh_with(8).await;
    mesh.register_agent(Agent::new("busy", "worker")).await.unwrap();

    mesh.subscribe(
        "busy",
        "workflow.step.dispatch",
        handler_fn(|_event| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }),
    )
    .await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    mesh.subscribe(
        "busy",
        "workflow.step.dispatch",
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .await;

    let spec = WorkflowSpec::new("wf-deadline")
        .with_timeout(Duration::from_millis(50))
        .step(StepSpec::new("s", "busy", "work"));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-deadline").await;
    assert_eq!(record.state, WorkflowState::TimedOut);
    assert_eq!(record.step_state("s"), Some(StepState::Cancelled));

    // The slow first handler finishes after the deadline; the second still gets the dispatch
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let deliveries = mesh
        .get_agent_interactions("busy")
        .await
        .into_iter()
        .filter(|i| i.to_agent == "busy" && i.event_type == "workflow.step.dispatch")
        .count();
    assert_eq!(deliveries, 2);
}

#[tokio::test]
async fn test_step_retry_override() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("flaky", "worker"), failing(log.clone()))
        .await
        .unwrap();

    let spec = WorkflowSpec::new("wf-override")
        .with_retry_policy(quick_retries(4))
        .step(StepSpec::new("once", "flaky", "try").with_retry_policy(RetryPolicy::none()));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-override").await;

    assert_eq!(record.steps["once"].attempts, 1);
    assert_eq!(starts(&log, "once"), 1);
}

#[tokio::test]
async fn test_workflow_timeout_ignores_late_completion() {
    let mesh = mesh_with(8).await;
    let dispatched: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));

    // Records dispatches and never answers
    let sink = Arc::clone(&dispatched);
    mesh.register_agent(Agent::new("silent", "worker")).await.unwrap();
    mesh.subscribe(
        "silent",
        "workflow.step.dispatch",
        handler_fn(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        }),
    )
    .await;

    let spec = WorkflowSpec::new("wf-timeout")
        .with_timeout(Duration::from_millis(100))
        .step(StepSpec::new("s1", "silent", "wait"))
        .step(StepSpec::new("s2", "silent", "after").depends_on(["s1"]));

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-timeout").await;

    assert_eq!(record.state, WorkflowState::TimedOut);
    assert_eq!(record.step_state("s1"), Some(StepState::Cancelled));
    assert_eq!(record.step_state("s2"), Some(StepState::Pending));

    let dispatch = dispatched.lock().unwrap()[0].clone();
    let late = mesh
        .publish_draft(
            EventDraft::new(
                "workflow.step.completed",
                json!({"workflowId": "wf-timeout", "stepId": "s1", "output": "late"}),
                "silent",
            )
            .with_correlation(dispatch.correlation_id),
        )
        .await;
    assert!(late.valid);

    let after = mesh.workflow_status("wf-timeout").unwrap();
    assert_eq!(after.state, WorkflowState::TimedOut);
    assert_eq!(after.step_state("s1"), Some(StepState::Cancelled));
    assert!(after.steps["s1"].output.is_none());
}

#[tokio::test]
async fn test_cyclic_workflow_never_dispatches() {
    let mesh = mesh_with(8).await;
    let spec = WorkflowSpec::new("wf-cycle")
        .step(StepSpec::new("a", "x", "act").depends_on(["b"]))
        .step(StepSpec::new("b", "x", "act").depends_on(["a"]));

    let err = mesh.submit_workflow(spec).await.unwrap_err();

    assert!(matches!(err, MeshError::CyclicDependency { .. }));
    assert!(mesh.workflow_status("wf-cycle").is_none());
    assert!(!mesh
        .get_event_history(100)
        .await
        .iter()
        .any(|e| e.event_type == EventKind::StepDispatch));
}

#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let mesh = mesh_with(8).await;
    let spec = WorkflowSpec::new("wf-ref").step(StepSpec::new("a", "x", "act").depends_on(["missing"]));

    let err = mesh.submit_workflow(spec).await.unwrap_err();
    assert_eq!(
        err,
        MeshError::UnknownStepReference {
            step: "a".to_string(),
            dependency: "missing".to_string(),
        }
    );
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let mesh = mesh_with(2).await;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (current, max) = (Arc::clone(&in_flight), Arc::clone(&peak));
    mesh.attach_capability(
        Agent::new("worker", "worker"),
        capability_fn(move |_event: Event| {
            let (current, max) = (Arc::clone(&current), Arc::clone(&max));
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    )
    .await
    .unwrap();

    let spec = (0..5).fold(WorkflowSpec::new("wf-wide"), |spec, i| {
        spec.step(StepSpec::new(format!("s{}", i), "worker", "work"))
    });

    mesh.submit_workflow(spec).await.unwrap();
    let record = finish(&mesh, "wf-wide").await;

    assert_eq!(record.state, WorkflowState::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_resubmission_after_finish() {
    let mesh = mesh_with(8).await;
    mesh.attach_capability(Agent::new("a", "worker"), recording(new_log(), Duration::ZERO))
        .await
        .unwrap();
    let spec = || WorkflowSpec::new("again").step(StepSpec::new("s", "a", "act"));

    mesh.submit_workflow(spec()).await.unwrap();
    assert_eq!(finish(&mesh, "again").await.state, WorkflowState::Completed);

    mesh.submit_workflow(spec()).await.unwrap();
    assert_eq!(finish(&mesh, "again").await.state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_bus_driven_submission() {
    let mesh = mesh_with(8).await;
    mesh.attach_capability(Agent::new("a", "worker"), recording(new_log(), Duration::ZERO))
        .await
        .unwrap();

    let result = mesh
        .publish(
            "dag_orchestration",
            json!({
                "workflowId": "from-bus",
                "dagSpec": {
                    "steps": [
                        {"id": "s1", "agentId": "a", "action": "go"},
                        {"id": "s2", "agentId": "a", "action": "go", "dependencies": ["s1"]}
                    ]
                }
            }),
            "client",
        )
        .await;
    assert!(result.valid);

    let record = finish(&mesh, "from-bus").await;
    assert_eq!(record.state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_record_replays_from_traces() {
    let mesh = mesh_with(8).await;
    let log = new_log();
    mesh.attach_capability(Agent::new("ok", "worker"), recording(log.clone(), Duration::ZERO))
        .await
        .unwrap();
    mesh.attach_capability(Agent::new("bad", "worker"), failing(log))
        .await
        .unwrap();

    let spec = WorkflowSpec::new("wf-replay")
        .with_retry_policy(quick_retries(2))
        .step(StepSpec::new("a", "ok", "act"))
        .step(StepSpec::new("b", "bad", "act").depends_on(["a"]))
        .step(StepSpec::new("c", "ok", "act").depends_on(["b"]));

    mesh.submit_workflow(spec).await.unwrap();
    let live = finish(&mesh, "wf-replay").await;
    let replayed = mesh
        .orchestrator()
        .replay_workflow("wf-replay")
        .await
        .unwrap();

    assert_eq!(replayed.state, live.state);
    for (step_id, step) in &live.steps {
        assert_eq!(replayed.steps[step_id].state, step.state);
        assert_eq!(replayed.steps[step_id].attempts, step.attempts);
        assert_eq!(replayed.steps[step_id].failure, step.failure);
    }
}

#[tokio::test]
async fn test_replay_follows_latest_submission() {
    let mesh = mesh_with(8).await;
    mesh.attach_capability(Agent::new("ok", "worker"), recording(new_log(), Duration::ZERO))
        .await
        .unwrap();
    mesh.attach_capability(Agent::new("bad", "worker"), failing(new_log()))
        .await
        .unwrap();

    mesh.submit_workflow(WorkflowSpec::new("wf-rerun").step(StepSpec::new("s", "ok", "act")))
        .await
        .unwrap();
    assert_eq!(finish(&mesh, "wf-rerun").await.state, WorkflowState::Completed);

    mesh.submit_workflow(
        WorkflowSpec::new("wf-rerun")
            .with_retry_policy(RetryPolicy::none())
            .step(StepSpec::new("s", "bad", "act")),
    )
    .await
    .unwrap();
    let live = finish(&mesh, "wf-rerun").await;
    let replayed = mesh
        .orchestrator()
        .replay_workflow("wf-rerun")
        .await
        .unwrap();

    assert_eq!(live.state, WorkflowState::Failed);
    assert_eq!(replayed.state, live.state);
    assert_eq!(replayed.steps["s"].state, StepState::Failed);
    assert_eq!(replayed.steps["s"].failure, live.steps["s"].failure);
}

#[tokio::test]
async fn test_state_changes_are_announced() {
    let mesh = mesh_with(8).await;
    mesh.attach_capability(Agent::new("a", "worker"), recording(new_log(), Duration::ZERO))
        .await
        .unwrap();

    mesh.submit_workflow(WorkflowSpec::new("wf-announce").step(StepSpec::new("s", "a", "act")))
        .await
        .unwrap();
    finish(&mesh, "wf-announce").await;
    // The terminal announcement is published right after the record settles
    tokio::time::sleep(Duration::from_millis(50)).await;

    let states: Vec<String> = mesh
        .get_event_history(100)
        .await
        .into_iter()
        .filter(|e| e.event_type == EventKind::WorkflowStateChanged)
        .filter_map(|e| e.payload_str("state").map(str::to_string))
        .collect();

    assert_eq!(states, vec!["running", "completed"]);
}
