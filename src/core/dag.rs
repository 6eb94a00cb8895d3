//! Step dependency graph.
//!
//! Built once per submitted workflow. Construction rejects malformed graphs
//! (duplicate ids, dangling references, cycles) so the scheduler can assume
//! a well-formed DAG.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{MeshError, MeshResult};

use super::workflow::WorkflowSpec;

/// Validated dependency graph of a workflow's steps
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Step ids in declaration order
    steps: Vec<String>,
    /// step -> steps it depends on
    dependencies: HashMap<String, Vec<String>>,
    /// step -> steps depending on it
    dependents: HashMap<String, Vec<String>>,
    /// Kahn order, ties broken by declaration order
    order: Vec<String>,
}

impl StepGraph {
    /// Build and validate the graph of a workflow spec
    pub fn build(spec: &WorkflowSpec) -> MeshResult<Self> {
        if spec.id.trim().is_empty() {
            return Err(MeshError::InvalidWorkflow(
                "workflow id must not be empty".to_string(),
            ));
        }
        if spec.steps.is_empty() {
            return Err(MeshError::EmptyWorkflow(spec.id.clone()));
        }

        let mut steps = Vec::with_capacity(spec.steps.len());
        let mut dependencies = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for step in &spec.steps {
            if step.id.trim().is_empty() {
                return Err(MeshError::InvalidWorkflow(format!(
                    "workflow '{}' has a step with an empty id",
                    spec.id
                )));
            }
            if step.agent_id.trim().is_empty() {
                return Err(MeshError::InvalidWorkflow(format!(
                    "step '{}' has no agent",
                    step.id
                )));
            }
            if dependencies.contains_key(&step.id) {
                return Err(MeshError::DuplicateStep(step.id.clone()));
            }
            steps.push(step.id.clone());
            dependents.insert(step.id.clone(), Vec::new());

            // Repeated dependency entries collapse into one edge
            let mut deps: Vec<String> = Vec::new();
            for dep in &step.dependencies {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            dependencies.insert(step.id.clone(), deps);
        }

        for step in &steps {
            for dep in &dependencies[step] {
                match dependents.get_mut(dep) {
                    Some(children) => children.push(step.clone()),
                    None => {
                        return Err(MeshError::UnknownStepReference {
                            step: step.clone(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
        }

        let order = kahn_order(&steps, &dependencies, &dependents)?;

        Ok(Self {
            steps,
            dependencies,
            dependents,
            order,
        })
    }

    /// Step ids in topological order
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Step ids in declaration order
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.dependencies.contains_key(step_id)
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.dependencies
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Steps that directly depend on a step
    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every step reachable through dependent edges, in topological order
    pub fn transitive_dependents(&self, step_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);

        while let Some(current) = queue.pop_front() {
            for child in self.dependents(current) {
                if seen.insert(child.as_str()) {
                    queue.push_back(child);
                }
            }
        }

        self.order
            .iter()
            .filter(|id| seen.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Steps with no dependencies
    pub fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .cloned()
            .collect()
    }
}

fn kahn_order(
    steps: &[String],
    dependencies: &HashMap<String, Vec<String>>,
    dependents: &HashMap<String, Vec<String>>,
) -> MeshResult<Vec<String>> {
    let position: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut in_degree: HashMap<&str, usize> = steps
        .iter()
        .map(|id| (id.as_str(), dependencies[id].len()))
        .collect();

    // Keyed by declaration position so the order is deterministic
    let mut ready: BTreeMap<usize, &str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| (position[id], *id))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(id.to_string());
        for child in &dependents[id] {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(position[child.as_str()], child.as_str());
                }
            }
        }
    }

    if order.len() != steps.len() {
        let cyclic: Vec<String> = steps
            .iter()
            .filter(|id| in_degree[id.as_str()] > 0)
            .cloned()
            .collect();
        return Err(MeshError::CyclicDependency { steps: cyclic });
    }

    Ok(order)
}
