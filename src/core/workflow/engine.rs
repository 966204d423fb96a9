#![allow(clippy::result_large_err)]

//! Generic DAG workflow executor: dependency-ordered task runs with per-task
//! timeouts, classified retries, durable state transitions, and cancellation.

use crate::core::error::AppError;
use crate::core::storage::{ContextStore, TaskRunRow};
use crate::core::types::{ErrorCategory, TaskStatus, WorkflowStatus};
use crate::core::workflow::context::{TaskErrorRecord, WorkflowContext, WorkflowMetadata};
use crate::core::workflow::definition::{
    TaskContext, TaskDefinition, TaskPayload, WorkflowDefinition,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes registered workflow definitions against a context store. Many
/// workflows may run concurrently; within one workflow, tasks run strictly in
/// dependency order.
pub struct WorkflowEngine<P: TaskPayload> {
    definitions: DashMap<String, Arc<WorkflowDefinition<P>>>,
    store: Arc<dyn ContextStore>,
    cancel_flags: DashMap<Uuid, Arc<AtomicBool>>,
}

impl<P: TaskPayload> WorkflowEngine<P> {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        WorkflowEngine {
            definitions: DashMap::new(),
            store,
            cancel_flags: DashMap::new(),
        }
    }

    /// Store a validated definition under its workflow-type id.
    pub fn register(&self, definition: WorkflowDefinition<P>) {
        self.definitions
            .insert(definition.id().to_string(), Arc::new(definition));
    }

    pub fn definition(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition<P>>> {
        self.definitions
            .get(workflow_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Run a workflow to its terminal state, suspending while tasks run.
    /// Task failures are reflected in the returned context (`failed`), not as
    /// an `Err`; `Err` is reserved for infrastructure problems.
    pub async fn execute(
        &self,
        workflow_type: &str,
        input: P,
    ) -> Result<WorkflowContext, AppError> {
        let context = self.create(workflow_type, &input)?;
        let workflow_id = context.workflow_id;
        self.run(context, input).await.map(|ctx| {
            debug!(workflow_id = %workflow_id, status = %ctx.status, "workflow finished");
            ctx
        })
    }

    /// Persist a `pending` context, then drive the run in the background.
    /// The returned id is immediately queryable via `get_context`.
    pub fn spawn(
        engine: &Arc<Self>,
        workflow_type: &str,
        input: P,
    ) -> Result<(Uuid, JoinHandle<()>), AppError> {
        let context = engine.create(workflow_type, &input)?;
        let workflow_id = context.workflow_id;
        let engine = Arc::clone(engine);
        let handle = tokio::spawn(async move {
            if let Err(err) = engine.run(context, input).await {
                warn!(workflow_id = %workflow_id, "workflow run aborted: {}", err);
            }
        });
        Ok((workflow_id, handle))
    }

    /// Strongly consistent read of the last persisted state.
    pub fn get_context(&self, workflow_id: &Uuid) -> Result<Option<WorkflowContext>, AppError> {
        self.store.load_context(workflow_id)
    }

    /// Mark a pending/running workflow as canceled. The in-flight task may
    /// finish but its result is discarded and no further task starts.
    /// Returns true iff a transition happened.
    pub fn cancel(&self, workflow_id: &Uuid) -> Result<bool, AppError> {
        let Some(mut context) = self.store.load_context(workflow_id)? else {
            return Ok(false);
        };
        if context.status.is_terminal() {
            return Ok(false);
        }
        // Flag first so the runner observes cancellation even if it persists
        // concurrently; the runner re-stamps `canceled` in that case.
        if let Some(flag) = self.cancel_flags.get(workflow_id) {
            flag.store(true, Ordering::SeqCst);
        }
        context.status = WorkflowStatus::Canceled;
        context.current_task = None;
        context.touch();
        self.store.save_context(&context)?;
        info!(workflow_id = %workflow_id, "workflow canceled");
        Ok(true)
    }

    /// Most recent first, optionally filtered by status.
    pub fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowContext>, AppError> {
        self.store.list_contexts(status)
    }

    /// Fail `running` workflows whose last update is older than the grace
    /// window. Called once on startup.
    pub fn recover_crashed(&self, grace: chrono::Duration) -> Result<usize, AppError> {
        let recovered = self.store.recover_crashed(grace)?;
        if recovered > 0 {
            warn!(count = recovered, "failed crashed workflows on startup");
        }
        Ok(recovered)
    }

    fn create(&self, workflow_type: &str, input: &P) -> Result<WorkflowContext, AppError> {
        if !self.definitions.contains_key(workflow_type) {
            return Err(AppError::new(
                ErrorCategory::NotFound,
                format!("workflow type '{}' is not registered", workflow_type),
            )
            .with_code("WF-EXEC-001"));
        }
        let mut metadata = WorkflowMetadata {
            input: serde_json::to_value(input)?,
            ..WorkflowMetadata::default()
        };
        if let Some(patch) = input.metadata_patch() {
            metadata.apply(patch);
        }
        let context = WorkflowContext::new(workflow_type, metadata);
        self.store.save_context(&context)?;
        Ok(context)
    }

    async fn run(
        &self,
        mut context: WorkflowContext,
        input: P,
    ) -> Result<WorkflowContext, AppError> {
        let definition = self
            .definition(&context.workflow_type)
            .ok_or_else(|| {
                AppError::new(ErrorCategory::NotFound, "workflow definition vanished")
                    .with_code("WF-EXEC-002")
            })?;
        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .insert(context.workflow_id, Arc::clone(&flag));
        let outcome = self
            .run_inner(&mut context, definition.as_ref(), input, &flag)
            .await;
        self.cancel_flags.remove(&context.workflow_id);
        outcome.map(|_| context)
    }

    async fn run_inner(
        &self,
        context: &mut WorkflowContext,
        definition: &WorkflowDefinition<P>,
        input: P,
        cancel: &AtomicBool,
    ) -> Result<(), AppError> {
        for task_name in definition.execution_order() {
            if cancel.load(Ordering::SeqCst) {
                return self.finish_canceled(context);
            }
            let task = definition
                .task(task_name)
                .expect("execution order only contains defined tasks");

            let task_input = match derive_input(definition, task_name, context, &input) {
                Ok(payload) => payload,
                Err(err) => return self.finish_failed(context, task_name, err),
            };

            if context.status == WorkflowStatus::Pending {
                context.status = WorkflowStatus::Running;
            }
            context.current_task = Some(task_name.clone());
            context.touch();
            self.store.save_context(context)?;

            let started_at = Utc::now();
            let task_context = TaskContext {
                workflow_id: context.workflow_id,
                task_name: task_name.clone(),
                attempt: 0,
                metadata: context.metadata.clone(),
            };
            let outcome = run_task(task, &task_context, task_input, cancel).await;

            if cancel.load(Ordering::SeqCst) {
                // Cancellation observed while the task ran: discard its result.
                return self.finish_canceled(context);
            }

            match outcome {
                Ok(output) => {
                    if output.kind() != task.output_kind {
                        let err = AppError::new(
                            ErrorCategory::SchemaMismatch,
                            format!(
                                "task '{}' produced '{}' output, expected '{}'",
                                task_name,
                                output.kind(),
                                task.output_kind
                            ),
                        )
                        .with_code("WF-SCHEMA-002");
                        return self.finish_failed(context, task_name, err);
                    }
                    if let Some(patch) = output.metadata_patch() {
                        context.metadata.apply(patch);
                    }
                    let value = serde_json::to_value(&output)?;
                    context.results.insert(task_name.clone(), value.clone());
                    context.touch();
                    self.store.record_task_run(&TaskRunRow {
                        workflow_id: context.workflow_id,
                        task_name: task_name.clone(),
                        status: TaskStatus::Success,
                        started_at,
                        completed_at: Some(Utc::now()),
                        result_data: Some(value),
                        error: None,
                    })?;
                    self.store.save_context(context)?;
                }
                Err(err) => {
                    self.store.record_task_run(&TaskRunRow {
                        workflow_id: context.workflow_id,
                        task_name: task_name.clone(),
                        status: TaskStatus::Failed,
                        started_at,
                        completed_at: Some(Utc::now()),
                        result_data: None,
                        error: Some(err.message.clone()),
                    })?;
                    return self.finish_failed(context, task_name, err);
                }
            }
        }

        context.status = WorkflowStatus::Completed;
        context.current_task = None;
        context.touch();
        self.store.save_context(context)
    }

    fn finish_canceled(&self, context: &mut WorkflowContext) -> Result<(), AppError> {
        context.status = WorkflowStatus::Canceled;
        context.current_task = None;
        context.touch();
        // Idempotent re-stamp: covers the race where a task persisted state
        // after cancel() already wrote `canceled`.
        self.store.save_context(context)
    }

    fn finish_failed(
        &self,
        context: &mut WorkflowContext,
        task_name: &str,
        error: AppError,
    ) -> Result<(), AppError> {
        warn!(
            workflow_id = %context.workflow_id,
            task = task_name,
            "task failed: {}",
            error
        );
        context
            .errors
            .insert(task_name.to_string(), TaskErrorRecord::from_error(&error));
        context.status = WorkflowStatus::Failed;
        context.current_task = Some(task_name.to_string());
        context.touch();
        self.store.save_context(context)
    }
}

/// Derive a task's input per the dependency rules: no prerequisites gets the
/// workflow input, one gets that prerequisite's output, two or more get a
/// merged record keyed by prerequisite name.
fn derive_input<P: TaskPayload>(
    definition: &WorkflowDefinition<P>,
    task_name: &str,
    context: &WorkflowContext,
    workflow_input: &P,
) -> Result<P, AppError> {
    let empty = std::collections::BTreeSet::new();
    let prerequisites = definition.prerequisites(task_name).unwrap_or(&empty);
    let payload = match prerequisites.len() {
        0 => workflow_input.clone(),
        1 => {
            let prereq = prerequisites.iter().next().expect("len checked");
            result_payload(context, prereq)?
        }
        _ => {
            let mut parts = BTreeMap::new();
            for prereq in prerequisites {
                parts.insert(prereq.clone(), result_payload(context, prereq)?);
            }
            P::merge(parts)
        }
    };

    let task = definition.task(task_name).expect("task exists");
    if payload.kind() != task.input_kind {
        return Err(AppError::new(
            ErrorCategory::SchemaMismatch,
            format!(
                "task '{}' received '{}' input, expected '{}'",
                task_name,
                payload.kind(),
                task.input_kind
            ),
        )
        .with_code("WF-SCHEMA-001"));
    }
    Ok(payload)
}

fn result_payload<P: TaskPayload>(
    context: &WorkflowContext,
    task_name: &str,
) -> Result<P, AppError> {
    let value: &Value = context.results.get(task_name).ok_or_else(|| {
        AppError::new(
            ErrorCategory::InternalError,
            format!("prerequisite '{}' has no recorded result", task_name),
        )
        .with_code("WF-EXEC-003")
    })?;
    serde_json::from_value(value.clone()).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("result of '{}' failed to deserialize: {}", task_name, err),
        )
        .with_code("WF-EXEC-004")
    })
}

/// Run one task with its timeout and retry budget. A task runs up to
/// `retries + 1` times; only classified-transient errors retry, with exactly
/// `retry_delay` between attempts. A timed-out attempt counts as transient.
async fn run_task<P: TaskPayload>(
    task: &TaskDefinition<P>,
    base_context: &TaskContext,
    input: P,
    cancel: &AtomicBool,
) -> Result<P, AppError> {
    let max_attempts = task.retries + 1;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let task_context = TaskContext {
            attempt,
            ..base_context.clone()
        };
        let execution = task.handler.run(&task_context, input.clone());
        let result = match timeout(task.timeout, execution).await {
            Ok(result) => result,
            Err(_) => Err(AppError::new(
                ErrorCategory::TimeoutError,
                format!(
                    "task '{}' timed out after {}ms",
                    task.name,
                    task.timeout.as_millis()
                ),
            )
            .with_code("WF-TIME-001")),
        };

        match result {
            Ok(output) => return Ok(output),
            Err(err) => {
                if attempt >= max_attempts || !err.retriable() {
                    return Err(err);
                }
                if cancel.load(Ordering::SeqCst) {
                    return Err(AppError::new(
                        ErrorCategory::WorkflowCanceled,
                        "workflow canceled between retry attempts",
                    )
                    .with_code("WF-CANCEL-001"));
                }
                debug!(
                    task = %task.name,
                    attempt,
                    "retrying after transient error: {}",
                    err
                );
                sleep(task.retry_delay).await;
            }
        }
    }
}
