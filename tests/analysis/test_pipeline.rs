//! End-to-end document analysis against a fixture catalog.

use attacklens::core::analysis::{
    analysis_workflow, AnalysisDeps, AnalysisPayload, AnalysisRequest, ExtractorRegistry,
    TASK_PREPARE, TASK_REPORT, WORKFLOW_TYPE,
};
use attacklens::core::catalog::CatalogService;
use attacklens::core::config::AppConfig;
use attacklens::core::report::Report;
use attacklens::core::storage::{ContextStore, ReportStore, SqliteStore};
use attacklens::core::types::WorkflowStatus;
use attacklens::core::workflow::{WorkflowContext, WorkflowEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FIXTURE_BUNDLE: &str = include_str!("../fixtures/attack_bundle.json");

const PHISHING_TEXT: &str =
    "The attackers used phishing emails with malicious attachments to gain initial access.";

struct Pipeline {
    _dir: TempDir,
    engine: Arc<WorkflowEngine<AnalysisPayload>>,
    store: Arc<SqliteStore>,
    catalog: Arc<CatalogService>,
    upload_dir: PathBuf,
}

fn pipeline_with(configure: impl FnOnce(&mut AppConfig)) -> Pipeline {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.storage.upload_dir = dir.path().join("uploads");
    config.catalog.cache_dir = dir.path().join("catalog");
    config.catalog.primary_url = String::new();
    config.catalog.backup_url = String::new();
    config.workflow.task_timeout_ms = 10_000;
    config.workflow.retry_delay_ms = 10;
    configure(&mut config);

    std::fs::create_dir_all(&config.storage.upload_dir).unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let catalog = Arc::new(CatalogService::new(config.catalog.clone(), None).unwrap());
    let bundle = serde_json::from_str(FIXTURE_BUNDLE).unwrap();
    catalog.install_bundle(&bundle).unwrap();

    let deps = Arc::new(AnalysisDeps {
        http: reqwest::Client::new(),
        catalog: Arc::clone(&catalog),
        extractors: ExtractorRegistry::standard(),
        report_store: Arc::clone(&store) as Arc<dyn ReportStore>,
        settings: config.analysis.clone(),
        upload_dir: config.storage.upload_dir.clone(),
    });
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&store) as Arc<dyn ContextStore>
    ));
    engine.register(analysis_workflow(deps, &config.workflow).unwrap());

    Pipeline {
        upload_dir: config.storage.upload_dir.clone(),
        _dir: dir,
        engine,
        store,
        catalog,
    }
}

fn pipeline() -> Pipeline {
    pipeline_with(|_| {})
}

impl Pipeline {
    async fn analyze_file(&self, name: &str, contents: &[u8]) -> WorkflowContext {
        let staged = self.upload_dir.join(name);
        std::fs::write(&staged, contents).unwrap();
        let request = AnalysisRequest {
            url: None,
            document_path: Some(staged),
            document_name: Some(name.to_string()),
            options: Default::default(),
        };
        self.engine
            .execute(WORKFLOW_TYPE, AnalysisPayload::Request(request))
            .await
            .unwrap()
    }

    async fn analyze_url(&self, url: &str) -> WorkflowContext {
        let request = AnalysisRequest {
            url: Some(url.to_string()),
            document_path: None,
            document_name: None,
            options: Default::default(),
        };
        self.engine
            .execute(WORKFLOW_TYPE, AnalysisPayload::Request(request))
            .await
            .unwrap()
    }

    fn report_of(&self, context: &WorkflowContext) -> Report {
        let report_id = context
            .results
            .get(TASK_REPORT)
            .and_then(|value| value.get("reportId"))
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .expect("completed workflow carries a report id");
        self.store
            .load_report(&report_id)
            .unwrap()
            .expect("report persisted")
    }
}

#[tokio::test]
async fn phishing_document_end_to_end() {
    let pipeline = pipeline();
    let context = pipeline.analyze_file("incident.txt", PHISHING_TEXT.as_bytes()).await;
    assert_eq!(context.status, WorkflowStatus::Completed);

    let report = pipeline.report_of(&context);
    assert_eq!(report.mitre_version, "2.0");
    assert_eq!(report.source_filename.as_deref(), Some("incident.txt"));

    let phishing = report
        .matches
        .iter()
        .find(|m| m.technique_id == "T1566")
        .expect("phishing technique matched");
    assert!(phishing.score >= 80, "score was {}", phishing.score);
    assert!(phishing.context.contains("phishing"));

    assert_eq!(report.summary.top_techniques[0].id, "T1566");
    assert!(*report.summary.tactics_breakdown.get("initial-access").unwrap() >= 1);
    assert_eq!(report.summary.match_count, report.matches.len());
    let high = report.matches.iter().filter(|m| m.score >= 85).count();
    assert_eq!(report.summary.high_confidence_count, high);

    // Matches are unique per technique and ordered by score.
    let mut seen = std::collections::HashSet::new();
    for m in &report.matches {
        assert!(seen.insert(m.technique_id.clone()), "duplicate technique");
        assert!(m.start_char < m.end_char);
    }
    for pair in report.matches.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn literal_technique_id_gets_the_bonus() {
    let pipeline = pipeline();
    let context = pipeline
        .analyze_file("note.txt", b"See T1486 for details.")
        .await;
    assert_eq!(context.status, WorkflowStatus::Completed);

    let report = pipeline.report_of(&context);
    let encrypted = report
        .matches
        .iter()
        .find(|m| m.technique_id == "T1486")
        .expect("literal id matched");
    assert!(encrypted.score >= 85, "score was {}", encrypted.score);
}

#[tokio::test]
async fn empty_document_produces_empty_report() {
    let pipeline = pipeline();
    let context = pipeline.analyze_file("empty.txt", b"").await;
    assert_eq!(context.status, WorkflowStatus::Completed);

    let report = pipeline.report_of(&context);
    assert!(report.matches.is_empty());
    assert_eq!(report.summary.match_count, 0);
    assert_eq!(report.summary.high_confidence_count, 0);
    assert!(report.summary.top_techniques.is_empty());
}

#[tokio::test]
async fn replaying_a_document_is_deterministic() {
    let pipeline = pipeline();
    let first = pipeline.analyze_file("a.txt", PHISHING_TEXT.as_bytes()).await;
    let second = pipeline.analyze_file("b.txt", PHISHING_TEXT.as_bytes()).await;

    let report_a = pipeline.report_of(&first);
    let report_b = pipeline.report_of(&second);
    let scores_a: Vec<(String, u8)> = report_a
        .matches
        .iter()
        .map(|m| (m.technique_id.clone(), m.score))
        .collect();
    let scores_b: Vec<(String, u8)> = report_b
        .matches
        .iter()
        .map(|m| (m.technique_id.clone(), m.score))
        .collect();
    assert_eq!(scores_a, scores_b);
}

#[tokio::test]
async fn oversized_document_fails_without_retry() {
    let pipeline = pipeline_with(|config| {
        config.analysis.max_document_bytes = 64;
    });
    let context = pipeline
        .analyze_file("big.txt", &vec![b'a'; 200])
        .await;
    assert_eq!(context.status, WorkflowStatus::Failed);
    let record = context.errors.get(TASK_PREPARE).unwrap();
    assert_eq!(record.category, "OversizedDocument");
    assert!(!record.retriable);
    assert!(record.message.contains("too large"));
    // No report was produced.
    assert!(!context.results.contains_key(TASK_REPORT));
}

#[tokio::test]
async fn transient_fetch_failures_are_retried_to_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string(PHISHING_TEXT),
        )
        .mount(&server)
        .await;

    let pipeline = pipeline();
    let context = pipeline.analyze_url(&format!("{}/doc", server.uri())).await;
    assert_eq!(context.status, WorkflowStatus::Completed);

    let report = pipeline.report_of(&context);
    assert!(report.matches.iter().any(|m| m.technique_id == "T1566"));
    assert_eq!(
        report.source_url.as_deref(),
        Some(format!("{}/doc", server.uri()).as_str())
    );
}

#[tokio::test]
async fn catalog_version_stays_consistent_within_a_workflow() {
    let pipeline = pipeline();
    let first = pipeline.analyze_file("one.txt", PHISHING_TEXT.as_bytes()).await;
    let report_one = pipeline.report_of(&first);
    assert_eq!(report_one.mitre_version, "2.0");

    // A refresh lands a new catalog version between submissions.
    let mut updated: serde_json::Value = serde_json::from_str(FIXTURE_BUNDLE).unwrap();
    updated["spec_version"] = serde_json::json!("3.0");
    pipeline.catalog.install_bundle(&updated).unwrap();
    // The old snapshot stays pinned for in-flight observers.
    assert!(pipeline.catalog.pinned("2.0").is_some());

    let second = pipeline.analyze_file("two.txt", PHISHING_TEXT.as_bytes()).await;
    let report_two = pipeline.report_of(&second);
    assert_eq!(report_two.mitre_version, "3.0");
}

#[tokio::test]
async fn html_documents_are_extracted_before_matching() {
    let pipeline = pipeline();
    let html = format!(
        "<html><head><title>Incident</title></head><body><p>{}</p></body></html>",
        PHISHING_TEXT
    );
    let context = pipeline.analyze_file("incident.html", html.as_bytes()).await;
    assert_eq!(context.status, WorkflowStatus::Completed);
    let report = pipeline.report_of(&context);
    assert!(report.matches.iter().any(|m| m.technique_id == "T1566"));
}

#[tokio::test]
async fn unsupported_binary_format_fails_permanently() {
    let pipeline = pipeline();
    let context = pipeline.analyze_file("report.pdf", b"%PDF-1.7 binary body").await;
    assert_eq!(context.status, WorkflowStatus::Failed);
    let record = context.errors.get(TASK_PREPARE).unwrap();
    assert_eq!(record.category, "UnsupportedFormat");
    assert!(!record.retriable);
}
