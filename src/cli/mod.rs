//! Command-line interface for agent-mesh.
//!
//! Offline inspection tools: check workflow files, validate payloads against
//! the built-in schemas, list event types, show the resolved configuration,
//! and dry-run a workflow against echo agents.

use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::agents::{capability_fn, StepRequest};
use crate::config::{self, MeshConfig};
use crate::core::{AgentMesh, SchemaRegistry, Validator, WorkflowSpec};
use crate::domain::{Agent, Event, WorkflowState};

/// agent-mesh - In-process event mesh and workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "agent-mesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a workflow file and print its execution order
    Check {
        /// Workflow spec (YAML or JSON)
        workflow: PathBuf,
    },

    /// Validate a payload against the schema of an event type
    Validate {
        /// Event type (canonical name or alias)
        event_type: String,

        /// JSON payload file (reads from stdin if not provided)
        #[arg(short, long)]
        payload: Option<PathBuf>,
    },

    /// List registered event types and their aliases
    Schemas,

    /// Show the resolved configuration
    Config,

    /// Execute a workflow against echo agents
    DryRun {
        /// Workflow spec (YAML or JSON)
        workflow: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Check { workflow } => check_workflow(&workflow),
            Commands::Validate {
                event_type,
                payload,
            } => validate_payload(&event_type, payload),
            Commands::Schemas => {
                list_schemas();
                Ok(())
            }
            Commands::Config => show_config(),
            Commands::DryRun { workflow } => dry_run(&workflow).await,
        }
    }
}

fn check_workflow(path: &Path) -> Result<()> {
    let spec = WorkflowSpec::from_file(path)?;
    let graph = spec
        .validate()
        .with_context(|| format!("Workflow '{}' is invalid", spec.id))?;
    let config = config::config()?;
    let settings = config.orchestrator_settings();

    println!("Workflow: {}", spec.id);
    if let Some(ref description) = spec.description {
        println!("Description: {}", description);
    }
    println!(
        "Timeout: {:?}",
        spec.timeout(settings.default_workflow_timeout)
    );
    println!(
        "Retry: {} attempt(s), {:?} backoff",
        spec.retry_policy.max_attempts, spec.retry_policy.backoff_strategy
    );
    println!("\nExecution order:");
    println!("{:<4} {:<20} {:<16} {:<16} {}", "#", "STEP", "AGENT", "ACTION", "AFTER");
    println!("{}", "-".repeat(75));

    for (i, step_id) in graph.topological_order().iter().enumerate() {
        let Some(step) = spec.get_step(step_id) else {
            continue;
        };
        let after = if step.dependencies.is_empty() {
            "-".to_string()
        } else {
            step.dependencies.join(", ")
        };
        println!(
            "{:<4} {:<20} {:<16} {:<16} {}",
            i + 1,
            step.id,
            step.agent_id,
            step.action,
            after
        );
    }

    Ok(())
}

fn validate_payload(event_type: &str, payload: Option<PathBuf>) -> Result<()> {
    let raw = match payload {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read payload from stdin")?;
            buffer
        }
    };
    let payload: Value = serde_json::from_str(&raw).context("Payload is not valid JSON")?;

    let config = config::config()?;
    let validator = Validator::new(SchemaRegistry::with_builtin(), config.validation_cache_capacity);
    let result = validator.validate(event_type, &payload);

    if let Some(ref normalized) = result.normalized_event {
        println!("Event type: {} -> {}", event_type, normalized.event_type);
        if let Some(ref context) = normalized.context {
            println!("Context: {}", context);
        }
    }
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    for error in &result.errors {
        eprintln!("error: {}", error);
    }

    if !result.valid {
        anyhow::bail!("Payload is invalid for '{}'", event_type);
    }
    println!("Payload is valid");
    Ok(())
}

fn list_schemas() {
    let registry = SchemaRegistry::with_builtin();

    println!("{:<28} {}", "EVENT TYPE", "ALIASES");
    println!("{}", "-".repeat(75));
    for (event_type, aliases) in registry.event_types() {
        let aliases = if aliases.is_empty() {
            "-".to_string()
        } else {
            aliases.join(", ")
        };
        println!("{:<28} {}", event_type, aliases);
    }
}

fn show_config() -> Result<()> {
    let config = config::config()?;

    match config.config_file {
        Some(ref path) => println!("# Config file: {}", path.display()),
        None => println!("# Config file: (none, using defaults)"),
    }
    print!("{}", serde_yaml::to_string(config).context("Failed to render config")?);
    Ok(())
}

async fn dry_run(path: &Path) -> Result<()> {
    let spec = WorkflowSpec::from_file(path)?;
    spec.validate()
        .with_context(|| format!("Workflow '{}' is invalid", spec.id))?;

    let config: MeshConfig = config::config()?.clone();
    let mesh = AgentMesh::new(config).await?;

    let agents: BTreeSet<&str> = spec.steps.iter().map(|s| s.agent_id.as_str()).collect();
    for agent in agents {
        mesh.attach_capability(
            Agent::new(agent, "echo"),
            capability_fn(|event: Event| async move {
                let request = StepRequest::from_event(&event)?;
                Ok(json!({
                    "action": request.action,
                    "parameters": request.parameters,
                }))
            }),
        )
        .await?;
    }

    let submission = mesh.submit_workflow(spec).await?;
    let record = mesh
        .wait_for_completion(&submission.workflow_id)
        .await
        .context("Workflow disappeared before completing")?;

    println!("Workflow: {}", record.id);
    println!("State: {}", record.state.as_str());
    println!("\nSteps:");
    for (step_id, step) in &record.steps {
        let detail = match step.failure {
            Some(ref failure) => failure.to_string(),
            None => format!("{} attempt(s)", step.attempts),
        };
        println!("  {:<20} {:<10} {}", step_id, format!("{:?}", step.state), detail);
    }

    if record.state != WorkflowState::Completed {
        anyhow::bail!("Workflow '{}' ended in state {}", record.id, record.state.as_str());
    }
    Ok(())
}
