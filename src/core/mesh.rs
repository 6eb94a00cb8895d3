//! `AgentMesh`: one handle over the validator, bus, context store,
//! orchestrator and observability sink, wired from a `MeshConfig`.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::agents::{self, AgentCapability};
use crate::config::MeshConfig;
use crate::domain::{Agent, ContextSlice, ContextSliceData, Event, EventDraft, EventKind, WorkflowRecord};
use crate::error::MeshResult;

use super::bus::{EventBus, EventHandler, SubscriptionId};
use super::context::{ContextPropagator, ContextStore, PropagationOptions, PropagationResult};
use super::observability::{Interaction, ObservabilitySink, ValidationStats};
use super::orchestrator::{WorkflowOrchestrator, WorkflowSubmission};
use super::schema::{Schema, SchemaRegistry};
use super::validator::{ValidationResult, Validator};
use super::workflow::WorkflowSpec;

/// The in-process agent mesh
pub struct AgentMesh {
    config: MeshConfig,
    validator: Arc<Validator>,
    bus: Arc<EventBus>,
    propagator: ContextPropagator,
    orchestrator: Arc<WorkflowOrchestrator>,
    sweeper: JoinHandle<()>,
}

impl AgentMesh {
    /// Build and start a mesh. Must be called inside a tokio runtime.
    pub async fn new(config: MeshConfig) -> MeshResult<Self> {
        let validator = Arc::new(Validator::new(
            SchemaRegistry::with_builtin(),
            config.validation_cache_capacity,
        ));
        let sink = Arc::new(ObservabilitySink::new(config.history_limit));
        let bus = Arc::new(EventBus::new(
            Arc::clone(&validator),
            sink,
            config.history_limit,
        ));

        let store = Arc::new(ContextStore::new(config.context_ttl()));
        let sweeper = store.spawn_sweeper(config.sweep_interval());
        let propagator = ContextPropagator::new(store, Arc::clone(&bus));

        let orchestrator = WorkflowOrchestrator::new(Arc::clone(&bus), config.orchestrator_settings());
        orchestrator.start().await?;

        info!(
            history_limit = config.history_limit,
            max_concurrency = config.max_concurrency,
            "Agent mesh started"
        );

        Ok(Self {
            config,
            validator,
            bus,
            propagator,
            orchestrator,
            sweeper,
        })
    }

    /// Mesh with default configuration
    pub async fn with_defaults() -> MeshResult<Self> {
        Self::new(MeshConfig::default()).await
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    pub fn context_store(&self) -> &Arc<ContextStore> {
        self.propagator.store()
    }

    pub fn observability(&self) -> &Arc<ObservabilitySink> {
        self.bus.observability()
    }

    // ------------------------------------------------------------------
    // Schemas
    // ------------------------------------------------------------------

    /// Register a schema under a canonical event type plus aliases
    pub fn register_event_type(&self, name: &str, aliases: &[&str], schema: Schema) -> MeshResult<EventKind> {
        let kind = EventKind::from_canonical(name);
        self.validator.register(kind.clone(), schema);
        for alias in aliases {
            self.validator.alias(*alias, name)?;
        }
        Ok(kind)
    }

    // ------------------------------------------------------------------
    // Agents and events
    // ------------------------------------------------------------------

    pub async fn register_agent(&self, agent: Agent) -> MeshResult<()> {
        self.bus.register_agent(agent).await
    }

    pub async fn subscribe(
        &self,
        agent_id: &str,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.bus.subscribe(agent_id, event_type, handler).await
    }

    /// Register an agent whose capability answers step dispatches
    pub async fn attach_capability(
        &self,
        agent: Agent,
        capability: Arc<dyn AgentCapability>,
    ) -> MeshResult<SubscriptionId> {
        agents::attach(&self.bus, agent, capability).await
    }

    pub async fn publish(&self, event_type: &str, payload: Value, source_agent: &str) -> ValidationResult {
        self.bus.publish(event_type, payload, source_agent).await
    }

    pub async fn publish_draft(&self, draft: EventDraft) -> ValidationResult {
        self.bus.publish_draft(draft).await
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    pub fn create_context_slice(&self, data: ContextSliceData) -> MeshResult<ContextSlice> {
        self.propagator.store().create(data)
    }

    pub async fn propagate_context(
        &self,
        slice: &ContextSlice,
        target_agents: &[String],
        options: &PropagationOptions,
    ) -> PropagationResult {
        self.propagator
            .propagate(slice, target_agents, options)
            .await
    }

    pub fn get_context_slice(&self, id: &str) -> Option<ContextSlice> {
        self.propagator.store().get(id)
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub async fn submit_workflow(&self, spec: WorkflowSpec) -> MeshResult<WorkflowSubmission> {
        self.orchestrator.submit_workflow(spec).await
    }

    pub fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.orchestrator.workflow_status(workflow_id)
    }

    pub async fn wait_for_completion(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        self.orchestrator.wait_for_completion(workflow_id).await
    }

    pub fn list_workflows(&self) -> Vec<WorkflowRecord> {
        self.orchestrator.list_workflows()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn get_event_history(&self, limit: usize) -> Vec<Event> {
        self.bus.event_history(limit).await
    }

    pub async fn get_validation_stats(&self) -> ValidationStats {
        self.bus.validation_stats().await
    }

    pub async fn get_agent_interactions(&self, agent_id: &str) -> Vec<Interaction> {
        self.bus.agent_interactions(agent_id).await
    }
}

impl Drop for AgentMesh {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{FieldRule, FieldType};
    use serde_json::json;

    #[tokio::test]
    async fn test_mesh_registers_orchestrator() {
        let mesh = AgentMesh::with_defaults().await.unwrap();
        let agents = mesh.bus().agents().await;

        assert!(agents.iter().any(|a| a.id == "orchestrator"));
    }

    #[tokio::test]
    async fn test_custom_event_type_with_alias() {
        let mesh = AgentMesh::with_defaults().await.unwrap();
        let kind = mesh
            .register_event_type(
                "metrics.sample",
                &["metric"],
                Schema::new().field(FieldRule::required("value", FieldType::Number)),
            )
            .unwrap();
        assert_eq!(kind, EventKind::Custom("metrics.sample".to_string()));

        let ok = mesh.publish("metric", json!({"value": 1.5}), "sensor").await;
        assert!(ok.valid);
        assert_eq!(
            ok.normalized_event.map(|e| e.event_type),
            Some(EventKind::Custom("metrics.sample".to_string()))
        );

        let bad = mesh.publish("metric", json!({"value": "high"}), "sensor").await;
        assert!(!bad.valid);
    }

    #[tokio::test]
    async fn test_context_roundtrip_through_facade() {
        let mesh = AgentMesh::with_defaults().await.unwrap();
        let slice = mesh
            .create_context_slice(ContextSliceData::new("ctx").with_domain("research"))
            .unwrap();

        assert_eq!(mesh.get_context_slice("ctx"), Some(slice));
        assert!(mesh.get_context_slice("other").is_none());
    }
}
