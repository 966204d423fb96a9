//! Core-facing persistence: small repository traits the engine, catalog and
//! report pipeline write through, plus the SQLite implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::core::catalog::{Technique, TechniqueIndex};
use crate::core::error::AppError;
use crate::core::report::Report;
use crate::core::types::{TaskStatus, WorkflowStatus};
use crate::core::workflow::WorkflowContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One task execution outcome for the task_results relation.
#[derive(Debug, Clone)]
pub struct TaskRunRow {
    pub workflow_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<Value>,
    pub error: Option<String>,
}

/// Workflow context persistence. The engine is the sole writer.
pub trait ContextStore: Send + Sync {
    fn save_context(&self, context: &WorkflowContext) -> Result<(), AppError>;
    fn load_context(&self, workflow_id: &Uuid) -> Result<Option<WorkflowContext>, AppError>;
    /// Most recent first.
    fn list_contexts(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowContext>, AppError>;
    fn record_task_run(&self, run: &TaskRunRow) -> Result<(), AppError>;
    /// Fail `running` workflows untouched for longer than `grace`; returns
    /// how many were transitioned.
    fn recover_crashed(&self, grace: chrono::Duration) -> Result<usize, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReportSortBy {
    #[default]
    Timestamp,
    Url,
    MatchCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filterable, paginated report listing parameters.
#[derive(Debug, Clone)]
pub struct ReportQuery {
    /// 1-based page number.
    pub page: usize,
    pub limit: usize,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub url_contains: Option<String>,
    pub min_matches: Option<usize>,
    pub techniques: Vec<String>,
    pub tactics: Vec<String>,
    pub sort_by: ReportSortBy,
    pub sort_order: SortOrder,
}

impl Default for ReportQuery {
    fn default() -> Self {
        ReportQuery {
            page: 1,
            limit: 20,
            date_from: None,
            date_to: None,
            url_contains: None,
            min_matches: None,
            techniques: Vec::new(),
            tactics: Vec::new(),
            sort_by: ReportSortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

/// Listing row without the match bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportListItem {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_url: Option<String>,
    pub source_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub mitre_version: String,
    pub match_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPage {
    pub items: Vec<ReportListItem>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Report persistence. A report and its matches are written in one
/// transaction and deleted in one transaction.
pub trait ReportStore: Send + Sync {
    fn insert_report(&self, report: &Report) -> Result<(), AppError>;
    fn load_report(&self, report_id: &Uuid) -> Result<Option<Report>, AppError>;
    fn delete_report(&self, report_id: &Uuid) -> Result<bool, AppError>;
    fn list_reports(&self, query: &ReportQuery) -> Result<ReportPage, AppError>;
}

/// Catalog technique persistence: refreshed on catalog updates and used as a
/// last-resort catalog source when both the network and the disk cache fail.
pub trait TechniqueStore: Send + Sync {
    fn upsert_techniques(&self, version: &str, index: &TechniqueIndex) -> Result<usize, AppError>;
    fn load_techniques(&self) -> Result<Option<(String, Vec<Technique>)>, AppError>;
}
