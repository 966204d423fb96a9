//! HTTP API behavior: submission validation, status polling, cancellation,
//! and report CRUD.

use attacklens::core::analysis::{
    analysis_workflow, AnalysisDeps, AnalysisPayload, ExtractorRegistry,
};
use attacklens::core::catalog::CatalogService;
use attacklens::core::config::AppConfig;
use attacklens::core::storage::{ContextStore, ReportStore, SqliteStore};
use attacklens::core::workflow::WorkflowEngine;
use attacklens::server::{serve_with_ready_notifier, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FIXTURE_BUNDLE: &str = include_str!("../fixtures/attack_bundle.json");

const PHISHING_TEXT: &str =
    "The attackers used phishing emails with malicious attachments to gain initial access.";

struct TestServer {
    _dir: TempDir,
    base: String,
    client: reqwest::Client,
    state: Arc<AppState>,
}

async fn start_server(configure: impl FnOnce(&mut AppConfig)) -> TestServer {
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
    let store = Arc::new(SqliteStore::open(&dir.path().join("state.db")).unwrap());
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
    let engine = Arc::new(WorkflowEngine::<AnalysisPayload>::new(
        Arc::clone(&store) as Arc<dyn ContextStore>
    ));
    engine.register(analysis_workflow(deps, &config.workflow).unwrap());

    let state = Arc::new(AppState {
        engine,
        reports: Arc::clone(&store) as Arc<dyn ReportStore>,
        catalog,
        upload_dir: config.storage.upload_dir.clone(),
        max_document_bytes: config.analysis.max_document_bytes,
    });

    let (ready_tx, ready_rx) = oneshot::channel();
    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        let _ = serve_with_ready_notifier(
            server_state,
            "127.0.0.1:0".parse().unwrap(),
            Some(ready_tx),
        )
        .await;
    });
    let addr = ready_rx.await.unwrap();

    TestServer {
        _dir: dir,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        state,
    }
}

async fn submit_upload(server: &TestServer, name: &str, bytes: Vec<u8>, mime: &str) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str(mime)
        .unwrap();
    let form = reqwest::multipart::Form::new().part("document", part);
    server
        .client
        .post(format!("{}/api/analyze", server.base))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

async fn wait_for_terminal(server: &TestServer, job_id: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server
            .client
            .get(format!("{}/api/analyze/{}", server.base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = body["status"].as_str().unwrap_or("");
        if matches!(status, "completed" | "failed" | "canceled") {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never reached a terminal state", job_id);
}

#[tokio::test]
async fn invalid_urls_are_rejected_without_creating_work() {
    let server = start_server(|_| {}).await;
    for bad in [
        "http://localhost/doc",
        "http://127.0.0.1/doc",
        "ftp://example.com/doc",
        "https://example.com/{weird}",
        "definitely not a url",
    ] {
        let response = server
            .client
            .post(format!("{}/api/analyze", server.base))
            .json(&json!({"url": bad}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "url {:?}", bad);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"]["code"], json!("INVALID_URL"));
    }
    assert!(server.state.engine.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_content_type_is_rejected() {
    let server = start_server(|_| {}).await;
    let response = server
        .client
        .post(format!("{}/api/analyze", server.base))
        .header("content-type", "text/csv")
        .body("a,b,c")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 415);
}

#[tokio::test]
async fn oversized_upload_creates_no_workflow() {
    let server = start_server(|config| {
        config.analysis.max_document_bytes = 2048;
    })
    .await;
    let response = submit_upload(&server, "big.txt", vec![b'a'; 2049], "text/plain").await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!("INVALID_DOCUMENT"));
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("too large"));
    assert!(server.state.engine.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn disallowed_upload_mime_is_rejected() {
    let server = start_server(|_| {}).await;
    let response = submit_upload(&server, "img.png", vec![0u8; 16], "image/png").await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], json!("UNSUPPORTED_FORMAT"));
}

#[tokio::test]
async fn upload_flow_runs_to_a_report() {
    let server = start_server(|_| {}).await;
    let response = submit_upload(
        &server,
        "incident.txt",
        PHISHING_TEXT.as_bytes().to_vec(),
        "text/plain",
    )
    .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["status"], json!("submitted"));
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();
    assert_eq!(
        body["data"]["statusUrl"],
        json!(format!("/api/analyze/{}", job_id))
    );

    let status = wait_for_terminal(&server, &job_id).await;
    assert_eq!(status["status"], json!("completed"));
    assert_eq!(status["progress"], json!(100));
    let report_url = status["reportUrl"].as_str().unwrap();

    let report: Value = server
        .client
        .get(format!("{}{}", server.base, report_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["success"], json!(true));
    let matches = report["data"]["matches"].as_array().unwrap();
    assert!(matches
        .iter()
        .any(|m| m["technique_id"] == json!("T1566")));
    assert_eq!(
        report["data"]["summary"]["match_count"],
        json!(matches.len())
    );
}

#[tokio::test]
async fn status_endpoint_validates_ids() {
    let server = start_server(|_| {}).await;
    let bad = server
        .client
        .get(format!("{}/api/analyze/not-a-uuid", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    let unknown = server
        .client
        .get(format!(
            "{}/api/analyze/00000000-0000-4000-8000-000000000000",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);
}

#[tokio::test]
async fn cancel_mid_flight_prevents_the_report() {
    // A slow upstream keeps prepare-document in flight long enough to cancel.
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string(PHISHING_TEXT)
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&upstream)
        .await;

    let server = start_server(|_| {}).await;
    let response = server
        .client
        .post(format!("{}/api/analyze", server.base))
        .json(&json!({"url": format!("{}/slow", upstream.uri())}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancel: Value = server
        .client
        .delete(format!("{}/api/analyze/{}", server.base, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancel["success"], json!(true));
    assert_eq!(cancel["data"]["canceled"], json!(true));

    let status = wait_for_terminal(&server, &job_id).await;
    assert_eq!(status["status"], json!("canceled"));
    assert!(status.get("reportId").is_none());

    // Let the in-flight task drain, then confirm no report appeared.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let reports: Value = server
        .client
        .get(format!("{}/api/reports", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reports["data"]["total"], json!(0));
}

#[tokio::test]
async fn reports_can_be_listed_filtered_and_deleted() {
    let server = start_server(|_| {}).await;
    for name in ["one.txt", "two.txt"] {
        let response = submit_upload(
            &server,
            name,
            PHISHING_TEXT.as_bytes().to_vec(),
            "text/plain",
        )
        .await;
        let body: Value = response.json().await.unwrap();
        let job_id = body["data"]["jobId"].as_str().unwrap().to_string();
        let status = wait_for_terminal(&server, &job_id).await;
        assert_eq!(status["status"], json!("completed"));
    }

    let listing: Value = server
        .client
        .get(format!("{}/api/reports", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["data"]["total"], json!(2));
    let first_id = listing["data"]["items"][0]["id"].as_str().unwrap().to_string();

    let filtered: Value = server
        .client
        .get(format!(
            "{}/api/reports?techniques=T1566&minMatches=1",
            server.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(filtered["data"]["total"], json!(2));

    let none: Value = server
        .client
        .get(format!("{}/api/reports?techniques=T9999", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(none["data"]["total"], json!(0));

    let bad_limit = server
        .client
        .get(format!("{}/api/reports?limit=500", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_limit.status(), 400);

    let deleted = server
        .client
        .delete(format!("{}/api/reports/{}", server.base, first_id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    let gone = server
        .client
        .delete(format!("{}/api/reports/{}", server.base, first_id))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    let remaining: Value = server
        .client
        .get(format!("{}/api/reports", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(remaining["data"]["total"], json!(1));
}
