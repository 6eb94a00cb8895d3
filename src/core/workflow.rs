//! Workflow definitions and loading.
//!
//! A workflow is a DAG of steps, each bound to an agent, an action and its
//! parameters. Specs are accepted as JSON (camelCase, timeouts in
//! milliseconds) or YAML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshResult;

use super::dag::StepGraph;

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// Workflow id (unique among active workflows)
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Steps forming the dependency graph
    pub steps: Vec<StepSpec>,

    /// Workflow deadline in milliseconds (uses the configured default if not set)
    #[serde(default, rename = "timeout", alias = "timeoutMs", alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,

    /// Retry policy applied to every step without its own
    #[serde(default, alias = "retry_policy")]
    pub retry_policy: RetryPolicy,
}

impl WorkflowSpec {
    /// Create an empty spec (mostly useful in code and tests)
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            steps: Vec::new(),
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Load a workflow from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Parse a workflow from JSON content
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse workflow JSON")
    }

    /// Parse a workflow from an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("Failed to decode workflow spec")
    }

    /// Validate the step graph and return it
    pub fn validate(&self) -> MeshResult<StepGraph> {
        StepGraph::build(self)
    }

    /// Effective workflow deadline
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Get a step by id
    pub fn get_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// A single step in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step id (unique within the workflow)
    pub id: String,

    /// Agent the step is dispatched to
    #[serde(alias = "agent_id", alias = "agent")]
    pub agent_id: String,

    /// Action the agent should perform
    pub action: String,

    /// Opaque parameters handed to the agent
    #[serde(default)]
    pub parameters: Value,

    /// Steps that must complete before this one starts
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,

    /// Per-attempt timeout in milliseconds (uses the configured default if not set)
    #[serde(default, rename = "timeout", alias = "timeoutMs", alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,

    /// Overrides the workflow retry policy for this step
    #[serde(default, alias = "retry_policy")]
    pub retry_policy: Option<RetryPolicy>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            parameters: Value::Null,
            dependencies: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Get the effective per-attempt timeout for this step
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Get the effective retry policy for this step
    pub fn retry_policy<'a>(&'a self, workflow: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry_policy.as_ref().unwrap_or(workflow)
    }
}

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay
    Fixed,
    /// Delay multiplies after each attempt, capped at `max_delay_ms`
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy for failed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts", alias = "max_attempts")]
    pub max_attempts: u32,

    #[serde(default, alias = "backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay", alias = "initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay", alias = "max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier", alias = "backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy with a constant delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Fixed,
            initial_delay_ms: delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Policy with a doubling delay, capped at `max_delay`
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier: 2.0,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay after a failed attempt (1-indexed) before the next one
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms as f64,
            BackoffStrategy::Exponential if attempt <= 1 => self.initial_delay_ms as f64,
            BackoffStrategy::Exponential => {
                self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32)
            }
        };

        let capped = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_WORKFLOW_YAML: &str = r#"
id: research
description: Test workflow

timeout: 5000
retry_policy:
  max_attempts: 2
  backoff_strategy: fixed
  initial_delay_ms: 100

steps:
  - id: validate
    agent_id: validator
    action: validate
    timeout: 1000

  - id: plan
    agent_id: planner
    action: plan
    depends_on: [validate]
    parameters:
      depth: 3
"#;

    #[test]
    fn test_workflow_yaml_parsing() {
        let spec = WorkflowSpec::from_yaml(TEST_WORKFLOW_YAML).unwrap();

        assert_eq!(spec.id, "research");
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.timeout_ms, Some(5000));
        assert_eq!(spec.retry_policy.max_attempts, 2);
        assert_eq!(spec.retry_policy.backoff_strategy, BackoffStrategy::Fixed);

        let plan = spec.get_step("plan").unwrap();
        assert_eq!(plan.dependencies, vec!["validate".to_string()]);
        assert_eq!(plan.parameters["depth"], 3);
        assert_eq!(plan.timeout(Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(
            spec.get_step("validate").unwrap().timeout(Duration::from_secs(30)),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_workflow_json_parsing() {
        let json = r#"{
            "id": "wf1",
            "steps": [
                {"id": "s1", "agentId": "a", "action": "validate", "dependencies": []},
                {"id": "s2", "agentId": "b", "action": "plan", "dependencies": ["s1"]}
            ],
            "timeout": 5000,
            "retryPolicy": {"maxAttempts": 3, "backoffStrategy": "exponential"}
        }"#;

        let spec = WorkflowSpec::from_json(json).unwrap();
        assert_eq!(spec.steps[1].agent_id, "b");
        assert_eq!(spec.timeout(Duration::from_secs(1)), Duration::from_millis(5000));
        assert_eq!(spec.retry_policy.backoff_strategy, BackoffStrategy::Exponential);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_step_policy_override() {
        let workflow_policy = RetryPolicy::default();
        let step = StepSpec::new("s", "a", "x").with_retry_policy(RetryPolicy::none());

        assert_eq!(step.retry_policy(&workflow_policy).max_attempts, 1);
        assert_eq!(
            StepSpec::new("t", "a", "x").retry_policy(&workflow_policy),
            &workflow_policy
        );
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(250));
        for attempt in 1..5 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!zero.should_retry(1));
    }
}
