//! Crash recovery: stale running workflows fail on startup, fresh ones are
//! left alone, and state survives process handoff through the database file.

use async_trait::async_trait;
use attacklens::core::error::AppError;
use attacklens::core::storage::{ContextStore, SqliteStore};
use attacklens::core::types::WorkflowStatus;
use attacklens::core::workflow::{
    TaskContext, TaskDefinition, TaskHandler, TaskPayload, WorkflowContext, WorkflowDefinition,
    WorkflowEngine, WorkflowMetadata,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Unit {
    Token,
    Join(BTreeMap<String, Unit>),
}

impl TaskPayload for Unit {
    fn kind(&self) -> &'static str {
        match self {
            Unit::Token => "token",
            Unit::Join(_) => "join",
        }
    }

    fn merge(parts: BTreeMap<String, Self>) -> Self {
        Unit::Join(parts)
    }
}

struct Pass;

#[async_trait]
impl TaskHandler<Unit> for Pass {
    async fn run(&self, _ctx: &TaskContext, input: Unit) -> Result<Unit, AppError> {
        Ok(input)
    }
}

fn seed_running_context(store: &SqliteStore, minutes_stale: i64) -> WorkflowContext {
    let mut context = WorkflowContext::new("document-analysis", WorkflowMetadata::default());
    context.status = WorkflowStatus::Running;
    context.current_task = Some("evaluate-document".to_string());
    context.updated_at = Utc::now() - ChronoDuration::minutes(minutes_stale);
    store.save_context(&context).unwrap();
    context
}

#[tokio::test]
async fn startup_recovery_fails_only_stale_workflows() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");

    // First process: leaves one stale and one fresh running workflow behind.
    let stale_id;
    let fresh_id;
    {
        let store = SqliteStore::open(&db_path).unwrap();
        stale_id = seed_running_context(&store, 45).workflow_id;
        fresh_id = seed_running_context(&store, 0).workflow_id;
    }

    // Second process: recovery sweep at startup.
    let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine: WorkflowEngine<Unit> = WorkflowEngine::new(Arc::clone(&store));
    let recovered = engine.recover_crashed(ChronoDuration::minutes(10)).unwrap();
    assert_eq!(recovered, 1);

    let stale = engine.get_context(&stale_id).unwrap().unwrap();
    assert_eq!(stale.status, WorkflowStatus::Failed);
    let (_task, record) = stale.last_error().unwrap();
    assert_eq!(record.category, "Crashed");
    assert!(!record.retriable);

    let fresh = engine.get_context(&fresh_id).unwrap().unwrap();
    assert_eq!(fresh.status, WorkflowStatus::Running);
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    seed_running_context(&store, 120);

    let engine: WorkflowEngine<Unit> =
        WorkflowEngine::new(Arc::clone(&store) as Arc<dyn ContextStore>);
    assert_eq!(engine.recover_crashed(ChronoDuration::minutes(10)).unwrap(), 1);
    assert_eq!(engine.recover_crashed(ChronoDuration::minutes(10)).unwrap(), 0);
}

#[tokio::test]
async fn completed_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state.db");

    let workflow_id = {
        let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let engine = Arc::new(WorkflowEngine::new(store));
        let definition = WorkflowDefinition::builder("pass-through")
            .task(
                TaskDefinition {
                    name: "only".to_string(),
                    input_kind: "token",
                    output_kind: "token",
                    timeout: Duration::from_secs(5),
                    retries: 0,
                    retry_delay: Duration::from_millis(1),
                    handler: Arc::new(Pass),
                },
                &[],
            )
            .build()
            .unwrap();
        engine.register(definition);
        let context = engine.execute("pass-through", Unit::Token).await.unwrap();
        assert_eq!(context.status, WorkflowStatus::Completed);
        context.workflow_id
    };

    let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine: WorkflowEngine<Unit> = WorkflowEngine::new(store);
    let loaded = engine.get_context(&workflow_id).unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Completed);
    assert!(loaded.results.contains_key("only"));
}
