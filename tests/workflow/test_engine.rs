//! Engine behavior: ordering, input derivation, retries, timeouts,
//! cancellation, persistence.

use async_trait::async_trait;
use attacklens::core::error::AppError;
use attacklens::core::storage::{ContextStore, SqliteStore};
use attacklens::core::types::{ErrorCategory, WorkflowStatus};
use attacklens::core::workflow::{
    TaskContext, TaskDefinition, TaskHandler, TaskPayload, WorkflowContext, WorkflowDefinition,
    WorkflowEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Probe {
    Seed { value: i64 },
    Step { trail: Vec<String>, value: i64 },
    Join(BTreeMap<String, Probe>),
}

impl TaskPayload for Probe {
    fn kind(&self) -> &'static str {
        match self {
            Probe::Seed { .. } => "seed",
            Probe::Step { .. } => "step",
            Probe::Join(_) => "join",
        }
    }

    fn merge(parts: BTreeMap<String, Self>) -> Self {
        Probe::Join(parts)
    }
}

fn trail_of(payload: &Probe) -> Vec<String> {
    match payload {
        Probe::Step { trail, .. } => trail.clone(),
        Probe::Seed { .. } => Vec::new(),
        Probe::Join(_) => panic!("join payload has no single trail"),
    }
}

/// Appends its task name to the trail and logs the execution order.
struct Append {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskHandler<Probe> for Append {
    async fn run(&self, _ctx: &TaskContext, input: Probe) -> Result<Probe, AppError> {
        self.log.lock().unwrap().push(self.name.to_string());
        let (mut trail, value) = match input {
            Probe::Seed { value } => (Vec::new(), value),
            Probe::Step { trail, value } => (trail, value),
            Probe::Join(parts) => {
                let mut merged: Vec<String> = parts
                    .values()
                    .flat_map(|part| trail_of(part))
                    .collect();
                merged.sort();
                merged.dedup();
                (merged, 0)
            }
        };
        trail.push(self.name.to_string());
        Ok(Probe::Step { trail, value })
    }
}

/// Fails with the configured category until `succeed_after` attempts passed.
struct Flaky {
    category: ErrorCategory,
    succeed_after: u32,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler<Probe> for Flaky {
    async fn run(&self, _ctx: &TaskContext, input: Probe) -> Result<Probe, AppError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.succeed_after {
            return Err(AppError::new(self.category, "injected failure"));
        }
        Ok(Probe::Step {
            trail: vec!["flaky".to_string()],
            value: attempt as i64,
        })
    }
}

struct Sleepy {
    duration: Duration,
}

#[async_trait]
impl TaskHandler<Probe> for Sleepy {
    async fn run(&self, _ctx: &TaskContext, _input: Probe) -> Result<Probe, AppError> {
        tokio::time::sleep(self.duration).await;
        Ok(Probe::Step {
            trail: vec!["sleepy".to_string()],
            value: 0,
        })
    }
}

fn task(
    name: &str,
    input_kind: &'static str,
    handler: Arc<dyn TaskHandler<Probe>>,
) -> TaskDefinition<Probe> {
    TaskDefinition {
        name: name.to_string(),
        input_kind,
        output_kind: "step",
        timeout: Duration::from_secs(5),
        retries: 0,
        retry_delay: Duration::from_millis(1),
        handler,
    }
}

fn engine() -> Arc<WorkflowEngine<Probe>> {
    let store: Arc<dyn ContextStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    Arc::new(WorkflowEngine::new(store))
}

#[tokio::test]
async fn linear_chain_runs_in_order_with_derived_inputs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let definition = WorkflowDefinition::builder("linear")
        .task(
            task("alpha", "seed", Arc::new(Append { name: "alpha", log: log.clone() })),
            &[],
        )
        .task(
            task("beta", "step", Arc::new(Append { name: "beta", log: log.clone() })),
            &["alpha"],
        )
        .task(
            task("gamma", "step", Arc::new(Append { name: "gamma", log: log.clone() })),
            &["beta"],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("linear", Probe::Seed { value: 7 })
        .await
        .unwrap();

    assert_eq!(context.status, WorkflowStatus::Completed);
    assert!(context.current_task.is_none());
    assert_eq!(*log.lock().unwrap(), vec!["alpha", "beta", "gamma"]);
    assert_eq!(context.results.len(), 3);

    // gamma received beta's output, which received alpha's.
    let final_payload: Probe =
        serde_json::from_value(context.results.get("gamma").unwrap().clone()).unwrap();
    assert_eq!(
        trail_of(&final_payload),
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );
    // The seed value flowed through the single-prerequisite derivations.
    match final_payload {
        Probe::Step { value, .. } => assert_eq!(value, 7),
        other => panic!("unexpected payload {:?}", other),
    }

    // Terminal state is what was persisted.
    let loaded = engine.get_context(&context.workflow_id).unwrap().unwrap();
    assert_eq!(loaded.status, WorkflowStatus::Completed);
    assert_eq!(loaded.results.len(), 3);
}

#[tokio::test]
async fn diamond_merges_prerequisite_outputs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let definition = WorkflowDefinition::builder("diamond")
        .task(
            task("a", "seed", Arc::new(Append { name: "a", log: log.clone() })),
            &[],
        )
        .task(
            task("b", "step", Arc::new(Append { name: "b", log: log.clone() })),
            &["a"],
        )
        .task(
            task("c", "step", Arc::new(Append { name: "c", log: log.clone() })),
            &["a"],
        )
        .task(
            task("d", "join", Arc::new(Append { name: "d", log: log.clone() })),
            &["b", "c"],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("diamond", Probe::Seed { value: 1 })
        .await
        .unwrap();

    assert_eq!(context.status, WorkflowStatus::Completed);
    // Stable order: ready tasks run lexicographically.
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);

    let final_payload: Probe =
        serde_json::from_value(context.results.get("d").unwrap().clone()).unwrap();
    let trail = trail_of(&final_payload);
    // d saw both b's and c's trails through the join record.
    assert!(trail.contains(&"b".to_string()));
    assert!(trail.contains(&"c".to_string()));
    assert_eq!(trail.last().unwrap(), "d");
}

#[tokio::test]
async fn transient_errors_retry_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut flaky_task = task(
        "flaky",
        "seed",
        Arc::new(Flaky {
            category: ErrorCategory::FetchError,
            succeed_after: 2,
            attempts: attempts.clone(),
        }),
    );
    flaky_task.retries = 3;
    flaky_task.retry_delay = Duration::from_millis(5);
    let definition = WorkflowDefinition::builder("retry")
        .task(flaky_task, &[])
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine.execute("retry", Probe::Seed { value: 0 }).await.unwrap();

    assert_eq!(context.status, WorkflowStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_errors_never_retry() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut failing = task(
        "validate",
        "seed",
        Arc::new(Flaky {
            category: ErrorCategory::ValidationError,
            succeed_after: 10,
            attempts: attempts.clone(),
        }),
    );
    failing.retries = 5;
    let definition = WorkflowDefinition::builder("permanent")
        .task(failing, &[])
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("permanent", Probe::Seed { value: 0 })
        .await
        .unwrap();

    assert_eq!(context.status, WorkflowStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let record = context.errors.get("validate").unwrap();
    assert!(!record.retriable);
}

#[tokio::test]
async fn exhausted_retries_fail_with_last_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut failing = task(
        "fetch",
        "seed",
        Arc::new(Flaky {
            category: ErrorCategory::FetchError,
            succeed_after: 100,
            attempts: attempts.clone(),
        }),
    );
    failing.retries = 2;
    failing.retry_delay = Duration::from_millis(2);
    let definition = WorkflowDefinition::builder("exhausted")
        .task(failing, &[])
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("exhausted", Probe::Seed { value: 0 })
        .await
        .unwrap();

    assert_eq!(context.status, WorkflowStatus::Failed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let record = context.errors.get("fetch").unwrap();
    assert!(record.retriable);
    assert!(record.message.contains("injected failure"));
}

#[tokio::test]
async fn slow_tasks_time_out_and_count_as_transient() {
    let mut slow = task("slow", "seed", Arc::new(Sleepy { duration: Duration::from_millis(500) }));
    slow.timeout = Duration::from_millis(30);
    slow.retries = 1;
    slow.retry_delay = Duration::from_millis(1);
    let definition = WorkflowDefinition::builder("timeout")
        .task(slow, &[])
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("timeout", Probe::Seed { value: 0 })
        .await
        .unwrap();

    assert_eq!(context.status, WorkflowStatus::Failed);
    let record = context.errors.get("slow").unwrap();
    assert_eq!(record.category, "TimeoutError");
    assert!(record.retriable);
}

#[tokio::test]
async fn generous_timeout_is_not_triggered() {
    let mut quick = task("quick", "seed", Arc::new(Sleepy { duration: Duration::from_millis(10) }));
    quick.timeout = Duration::from_secs(2);
    let definition = WorkflowDefinition::builder("no-timeout")
        .task(quick, &[])
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("no-timeout", Probe::Seed { value: 0 })
        .await
        .unwrap();
    assert_eq!(context.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn cancel_discards_in_flight_result_and_stops() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let definition = WorkflowDefinition::builder("cancelable")
        .task(
            task("first", "seed", Arc::new(Append { name: "first", log: log.clone() })),
            &[],
        )
        .task(
            task("second", "step", Arc::new(Sleepy { duration: Duration::from_millis(400) })),
            &["first"],
        )
        .task(
            task("third", "step", Arc::new(Append { name: "third", log: log.clone() })),
            &["second"],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let (workflow_id, handle) =
        WorkflowEngine::spawn(&engine, "cancelable", Probe::Seed { value: 0 }).unwrap();

    // Let `first` finish and `second` get in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.cancel(&workflow_id).unwrap());
    handle.await.unwrap();

    let context = engine.get_context(&workflow_id).unwrap().unwrap();
    assert_eq!(context.status, WorkflowStatus::Canceled);
    // The in-flight task's result was discarded and nothing after it ran.
    assert!(context.results.contains_key("first"));
    assert!(!context.results.contains_key("second"));
    assert!(!context.results.contains_key("third"));
    assert!(!log.lock().unwrap().contains(&"third".to_string()));

    // Cancel is idempotent; a second call reports no transition.
    assert!(!engine.cancel(&workflow_id).unwrap());
}

#[tokio::test]
async fn unknown_workflow_type_is_rejected() {
    let engine = engine();
    let error = engine
        .execute("ghost", Probe::Seed { value: 0 })
        .await
        .unwrap_err();
    assert_eq!(error.category, ErrorCategory::NotFound);
}

#[tokio::test]
async fn list_returns_most_recent_first_with_status_filter() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let definition = WorkflowDefinition::builder("listed")
        .task(
            task("only", "seed", Arc::new(Append { name: "only", log })),
            &[],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let first = engine.execute("listed", Probe::Seed { value: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = engine.execute("listed", Probe::Seed { value: 2 }).await.unwrap();

    let all = engine.list(None).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].workflow_id, second.workflow_id);
    assert_eq!(all[1].workflow_id, first.workflow_id);

    let completed = engine.list(Some(WorkflowStatus::Completed)).unwrap();
    assert_eq!(completed.len(), 2);
    let failed = engine.list(Some(WorkflowStatus::Failed)).unwrap();
    assert!(failed.is_empty());
}

#[tokio::test]
async fn mismatched_payload_kind_fails_validation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    // Declares a "step" input but the workflow input is a seed.
    let definition = WorkflowDefinition::builder("mismatch")
        .task(
            task("strict", "step", Arc::new(Append { name: "strict", log })),
            &[],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let context = engine
        .execute("mismatch", Probe::Seed { value: 0 })
        .await
        .unwrap();
    assert_eq!(context.status, WorkflowStatus::Failed);
    let record = context.errors.get("strict").unwrap();
    assert_eq!(record.category, "SchemaMismatch");
    assert!(!record.retriable);
}

/// Confirms persisted checkpoints exist after every task, not only at the
/// end: the context read mid-flight must already carry the first result.
#[tokio::test]
async fn intermediate_results_are_persisted_before_later_tasks_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let definition = WorkflowDefinition::builder("checkpointed")
        .task(
            task("early", "seed", Arc::new(Append { name: "early", log: log.clone() })),
            &[],
        )
        .task(
            task("late", "step", Arc::new(Sleepy { duration: Duration::from_millis(300) })),
            &["early"],
        )
        .build()
        .unwrap();

    let engine = engine();
    engine.register(definition);
    let (workflow_id, handle) =
        WorkflowEngine::spawn(&engine, "checkpointed", Probe::Seed { value: 0 }).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mid_flight: WorkflowContext = engine.get_context(&workflow_id).unwrap().unwrap();
    assert_eq!(mid_flight.status, WorkflowStatus::Running);
    assert!(mid_flight.results.contains_key("early"));
    assert_eq!(mid_flight.current_task.as_deref(), Some("late"));

    handle.await.unwrap();
    let done = engine.get_context(&workflow_id).unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
}
