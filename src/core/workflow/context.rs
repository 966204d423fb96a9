//! Persisted workflow execution state.

use crate::core::error::AppError;
use crate::core::types::WorkflowStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Error recorded against a task, kept small enough to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorRecord {
    pub category: String,
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl TaskErrorRecord {
    pub fn from_error(error: &AppError) -> Self {
        TaskErrorRecord {
            category: format!("{:?}", error.category),
            code: error.code.clone(),
            message: error.message.clone(),
            retriable: error.retriable(),
        }
    }
}

/// Submission metadata carried by a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// The original input payload, serialized.
    pub input: Value,
    pub source_url: Option<String>,
    pub source_filename: Option<String>,
    pub document_format: Option<String>,
}

/// Metadata refinements produced by task outputs.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub source_url: Option<String>,
    pub source_filename: Option<String>,
    pub document_format: Option<String>,
}

impl WorkflowMetadata {
    pub fn apply(&mut self, patch: MetadataPatch) {
        if patch.source_url.is_some() {
            self.source_url = patch.source_url;
        }
        if patch.source_filename.is_some() {
            self.source_filename = patch.source_filename;
        }
        if patch.document_format.is_some() {
            self.document_format = patch.document_format;
        }
    }
}

/// Full workflow execution state. Persisted on every observable transition
/// and on every task-result write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_task: Option<String>,
    /// Task name -> serialized output payload. A task's entry appears only
    /// after it completed successfully.
    pub results: BTreeMap<String, Value>,
    /// Task name -> final error, for tasks that exhausted their retries.
    pub errors: BTreeMap<String, TaskErrorRecord>,
    pub metadata: WorkflowMetadata,
}

impl WorkflowContext {
    pub fn new(workflow_type: &str, metadata: WorkflowMetadata) -> Self {
        let now = Utc::now();
        WorkflowContext {
            workflow_id: Uuid::new_v4(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::Pending,
            started_at: now,
            updated_at: now,
            current_task: None,
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            metadata,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn completed_task_count(&self) -> usize {
        self.results.len()
    }

    /// The error of the task that stopped this workflow, if any.
    pub fn last_error(&self) -> Option<(&str, &TaskErrorRecord)> {
        self.errors
            .iter()
            .next()
            .map(|(name, record)| (name.as_str(), record))
    }
}
