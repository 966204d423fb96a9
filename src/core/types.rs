use serde::{Deserialize, Serialize};

/// Workflow lifecycle status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Canceled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(WorkflowStatus::Pending),
            "running" => Some(WorkflowStatus::Running),
            "completed" => Some(WorkflowStatus::Completed),
            "failed" => Some(WorkflowStatus::Failed),
            "canceled" => Some(WorkflowStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task run status for persisted task_results rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    // Permanent validation failures.
    ValidationError,
    InvalidUrl,
    UnsupportedFormat,
    OversizedDocument,
    InvalidWorkflowDefinition,
    SchemaMismatch,
    // Transient failures eligible for retry.
    FetchError,
    RateLimited,
    UpstreamServerError,
    TimeoutError,
    // Workflow-level outcomes.
    TaskFailed,
    WorkflowCanceled,
    Crashed,
    // Infrastructure.
    NotFound,
    IoError,
    SerializationError,
    StorageError,
    InternalError,
}

impl ErrorCategory {
    /// Transient by construction, before the message heuristic is applied.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::FetchError
                | ErrorCategory::RateLimited
                | ErrorCategory::UpstreamServerError
                | ErrorCategory::TimeoutError
        )
    }

    /// Never retried, regardless of message.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ValidationError
                | ErrorCategory::InvalidUrl
                | ErrorCategory::UnsupportedFormat
                | ErrorCategory::OversizedDocument
                | ErrorCategory::InvalidWorkflowDefinition
                | ErrorCategory::SchemaMismatch
                | ErrorCategory::WorkflowCanceled
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
