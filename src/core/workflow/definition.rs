#![allow(clippy::result_large_err)]

//! Workflow and task definitions: a named, frozen DAG validated at build
//! time.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::context::{MetadataPatch, WorkflowMetadata};
use async_trait::async_trait;
use indexmap::IndexMap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Task input/output values. Implementations are tagged enums with one
/// variant per payload shape; `kind` is the tag the engine validates against
/// a task's declared schema.
pub trait TaskPayload:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn kind(&self) -> &'static str;

    /// Combine the outputs of two or more prerequisites, keyed by task name.
    fn merge(parts: BTreeMap<String, Self>) -> Self;

    /// Metadata refinements the engine folds into the workflow context when
    /// this payload is produced.
    fn metadata_patch(&self) -> Option<MetadataPatch> {
        None
    }
}

/// Execution context handed to task handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: Uuid,
    pub task_name: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub metadata: WorkflowMetadata,
}

/// Trait implemented by task handlers. Handlers must be idempotent with
/// respect to their inputs; the engine retries without deduplicating side
/// effects.
#[async_trait]
pub trait TaskHandler<P: TaskPayload>: Send + Sync {
    async fn run(&self, ctx: &TaskContext, input: P) -> Result<P, AppError>;
}

/// One node of the workflow DAG.
pub struct TaskDefinition<P: TaskPayload> {
    pub name: String,
    pub input_kind: &'static str,
    pub output_kind: &'static str,
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Exact wait between attempts.
    pub retry_delay: Duration,
    pub handler: Arc<dyn TaskHandler<P>>,
}

/// A named, frozen workflow definition. Validated once at build time;
/// immutable afterwards.
pub struct WorkflowDefinition<P: TaskPayload> {
    id: String,
    tasks: IndexMap<String, TaskDefinition<P>>,
    dependencies: HashMap<String, BTreeSet<String>>,
    /// Stable topological order: among ready tasks, lexicographic by name.
    order: Vec<String>,
}

impl<P: TaskPayload> std::fmt::Debug for WorkflowDefinition<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .field("order", &self.order)
            .finish()
    }
}

impl<P: TaskPayload> WorkflowDefinition<P> {
    pub fn builder(id: &str) -> WorkflowDefinitionBuilder<P> {
        WorkflowDefinitionBuilder {
            id: id.to_string(),
            tasks: IndexMap::new(),
            dependencies: HashMap::new(),
            duplicate: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition<P>> {
        self.tasks.get(name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn prerequisites(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(name)
    }
}

pub struct WorkflowDefinitionBuilder<P: TaskPayload> {
    id: String,
    tasks: IndexMap<String, TaskDefinition<P>>,
    dependencies: HashMap<String, BTreeSet<String>>,
    duplicate: Option<String>,
}

impl<P: TaskPayload> WorkflowDefinitionBuilder<P> {
    pub fn task(mut self, definition: TaskDefinition<P>, prerequisites: &[&str]) -> Self {
        let name = definition.name.clone();
        if self.tasks.insert(name.clone(), definition).is_some() {
            self.duplicate = Some(name.clone());
        }
        self.dependencies.insert(
            name,
            prerequisites.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition<P>, AppError> {
        if let Some(name) = self.duplicate {
            return Err(AppError::new(
                ErrorCategory::InvalidWorkflowDefinition,
                format!("duplicate task name '{}'", name),
            )
            .with_code("WF-DEF-001"));
        }
        for (task, prereqs) in &self.dependencies {
            for prereq in prereqs {
                if !self.tasks.contains_key(prereq) {
                    return Err(AppError::new(
                        ErrorCategory::InvalidWorkflowDefinition,
                        format!("task '{}' depends on undefined task '{}'", task, prereq),
                    )
                    .with_code("WF-DEF-002"));
                }
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.tasks.keys() {
            graph.add_node(name.as_str());
        }
        for (task, prereqs) in &self.dependencies {
            for prereq in prereqs {
                graph.add_edge(prereq.as_str(), task.as_str(), ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(AppError::new(
                ErrorCategory::InvalidWorkflowDefinition,
                format!("workflow '{}' dependency graph contains a cycle", self.id),
            )
            .with_code("WF-DEF-003"));
        }

        let order = stable_topological_order(&self.tasks, &self.dependencies);
        Ok(WorkflowDefinition {
            id: self.id,
            tasks: self.tasks,
            dependencies: self.dependencies,
            order,
        })
    }
}

/// Kahn's algorithm with a lexicographically ordered ready set, so test runs
/// are deterministic regardless of registration order.
fn stable_topological_order<P: TaskPayload>(
    tasks: &IndexMap<String, TaskDefinition<P>>,
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> = tasks
        .keys()
        .map(|name| {
            let degree = dependencies.get(name).map(BTreeSet::len).unwrap_or(0);
            (name.as_str(), degree)
        })
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, prereqs) in dependencies {
        for prereq in prereqs {
            dependents
                .entry(prereq.as_str())
                .or_default()
                .push(task.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    loop {
        let Some(&next) = ready.iter().next() else {
            break;
        };
        ready.remove(next);
        order.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for &child in children {
                if let Some(degree) = remaining.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
    }
    order
}
