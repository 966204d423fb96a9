//! The document-analysis workflow: payload shapes, extractors, task handlers
//! and the frozen four-task definition.

pub mod extract;
pub mod payload;
pub mod tasks;

pub use extract::{detect_format, DocumentFormat, Extractor, ExtractorRegistry};
pub use payload::{
    AnalysisOptions, AnalysisPayload, AnalysisRequest, CatalogRef, DocumentBundle,
    DocumentMetadata, PreparedDocument, ReportRef,
};
pub use tasks::{
    validate_submission_url, AnalysisDeps, TASK_CATALOG, TASK_EVALUATE, TASK_PREPARE, TASK_REPORT,
};

use crate::core::analysis::payload::{
    KIND_CATALOG, KIND_DOCUMENT, KIND_EVALUATION, KIND_JOIN, KIND_REPORT, KIND_REQUEST,
};
use crate::core::analysis::tasks::{
    EvaluateDocument, GenerateReport, GetMitreData, PrepareDocument,
};
use crate::core::config::WorkflowConfig;
use crate::core::error::AppError;
use crate::core::workflow::{TaskDefinition, WorkflowDefinition};
use std::sync::Arc;
use std::time::Duration;

pub const WORKFLOW_TYPE: &str = "document-analysis";

/// Total tasks in the analysis workflow, used for progress math.
pub const TASK_COUNT: usize = 4;

/// Build the frozen document-analysis workflow definition. The chain is
/// linear by design so matching always observes the catalog version fetched
/// within the same run.
pub fn analysis_workflow(
    deps: Arc<AnalysisDeps>,
    workflow: &WorkflowConfig,
) -> Result<WorkflowDefinition<AnalysisPayload>, AppError> {
    let timeout = Duration::from_millis(workflow.task_timeout_ms);
    let retry_delay = Duration::from_millis(workflow.retry_delay_ms);
    let retries = workflow.task_retries;

    WorkflowDefinition::builder(WORKFLOW_TYPE)
        .task(
            TaskDefinition {
                name: TASK_PREPARE.to_string(),
                input_kind: KIND_REQUEST,
                output_kind: KIND_DOCUMENT,
                timeout,
                retries,
                retry_delay,
                handler: Arc::new(PrepareDocument {
                    deps: Arc::clone(&deps),
                }),
            },
            &[],
        )
        .task(
            TaskDefinition {
                name: TASK_CATALOG.to_string(),
                input_kind: KIND_DOCUMENT,
                output_kind: KIND_CATALOG,
                timeout,
                retries,
                retry_delay,
                handler: Arc::new(GetMitreData {
                    deps: Arc::clone(&deps),
                }),
            },
            &[TASK_PREPARE],
        )
        .task(
            TaskDefinition {
                name: TASK_EVALUATE.to_string(),
                input_kind: KIND_JOIN,
                output_kind: KIND_EVALUATION,
                timeout,
                retries,
                retry_delay,
                handler: Arc::new(EvaluateDocument {
                    deps: Arc::clone(&deps),
                }),
            },
            &[TASK_PREPARE, TASK_CATALOG],
        )
        .task(
            TaskDefinition {
                name: TASK_REPORT.to_string(),
                input_kind: KIND_JOIN,
                output_kind: KIND_REPORT,
                timeout,
                retries,
                retry_delay,
                handler: Arc::new(GenerateReport { deps }),
            },
            &[TASK_PREPARE, TASK_EVALUATE, TASK_CATALOG],
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_orders_the_four_tasks() {
        // Definition-level checks that need no handlers to run.
        use crate::core::catalog::CatalogService;
        use crate::core::config::{AnalysisConfig, CatalogConfig};
        use crate::core::storage::SqliteStore;

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let catalog = Arc::new(CatalogService::new(CatalogConfig::default(), None).unwrap());
        let deps = Arc::new(AnalysisDeps {
            http: reqwest::Client::new(),
            catalog,
            extractors: ExtractorRegistry::standard(),
            report_store: store,
            settings: AnalysisConfig::default(),
            upload_dir: std::env::temp_dir(),
        });
        let definition = analysis_workflow(deps, &WorkflowConfig::default()).unwrap();
        assert_eq!(definition.task_count(), TASK_COUNT);
        assert_eq!(
            definition.execution_order(),
            &[TASK_PREPARE, TASK_CATALOG, TASK_EVALUATE, TASK_REPORT]
        );
    }
}
