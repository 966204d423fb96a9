//! Command implementations behind the CLI surface.

use crate::cli::args::{AnalyzeArgs, RefreshCatalogArgs, ServeArgs};
use crate::core::analysis::{
    analysis_workflow, AnalysisDeps, AnalysisPayload, AnalysisRequest, ExtractorRegistry,
    TASK_REPORT, WORKFLOW_TYPE,
};
use crate::core::catalog::CatalogService;
use crate::core::config::{AppConfig, ConfigLoader};
use crate::core::storage::{ReportStore, SqliteStore, TechniqueStore};
use crate::core::types::WorkflowStatus;
use crate::core::workflow::WorkflowEngine;
use crate::server::{self, AppState};
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Everything a command needs, wired once from the configuration.
struct Runtime {
    config: AppConfig,
    store: Arc<SqliteStore>,
    catalog: Arc<CatalogService>,
    engine: Arc<WorkflowEngine<AnalysisPayload>>,
}

fn load_config(config_dir: Option<&Path>) -> Result<AppConfig> {
    let dir = match config_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    ConfigLoader::load_from_dir(&dir)
        .map_err(|err| anyhow!("configuration error: {}", err))
}

fn build_runtime(config: AppConfig) -> Result<Runtime> {
    let store = Arc::new(
        SqliteStore::open(&config.storage.db_path)
            .map_err(|err| anyhow!("failed to initialize database: {}", err))?,
    );
    let technique_store: Arc<dyn TechniqueStore> = Arc::clone(&store) as Arc<dyn TechniqueStore>;
    let catalog = Arc::new(
        CatalogService::new(config.catalog.clone(), Some(technique_store))
            .map_err(|err| anyhow!("failed to initialize catalog service: {}", err))?,
    );
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.catalog.fetch_timeout_seconds,
        ))
        .build()
        .context("failed to build http client")?;
    let deps = Arc::new(AnalysisDeps {
        http,
        catalog: Arc::clone(&catalog),
        extractors: ExtractorRegistry::standard(),
        report_store: Arc::clone(&store) as Arc<dyn ReportStore>,
        settings: config.analysis.clone(),
        upload_dir: config.storage.upload_dir.clone(),
    });
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&store) as Arc<dyn crate::core::storage::ContextStore>
    ));
    engine.register(
        analysis_workflow(deps, &config.workflow)
            .map_err(|err| anyhow!("invalid workflow definition: {}", err))?,
    );
    Ok(Runtime {
        config,
        store,
        catalog,
        engine,
    })
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config_dir.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let runtime = build_runtime(config)?;

    let grace = chrono::Duration::minutes(runtime.config.workflow.recovery_grace_minutes);
    runtime
        .engine
        .recover_crashed(grace)
        .map_err(|err| anyhow!("startup recovery failed: {}", err))?;

    // Warm the catalog in the background; serving starts regardless.
    let warmup = Arc::clone(&runtime.catalog);
    tokio::spawn(async move {
        if let Err(err) = warmup.snapshot().await {
            tracing::warn!("catalog warm-up failed: {}", err);
        }
    });

    let bind = runtime
        .config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", runtime.config.server.bind))?;
    let state = Arc::new(AppState {
        engine: Arc::clone(&runtime.engine),
        reports: Arc::clone(&runtime.store) as Arc<dyn ReportStore>,
        catalog: Arc::clone(&runtime.catalog),
        upload_dir: runtime.config.storage.upload_dir.clone(),
        max_document_bytes: runtime.config.analysis.max_document_bytes,
    });
    server::serve(state, bind)
        .await
        .map_err(|err| anyhow!("server failed: {}", err))
}

pub async fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = load_config(args.config_dir.as_deref())?;
    if let Some(min_confidence) = args.min_confidence {
        config.analysis.min_confidence = min_confidence;
    }
    let runtime = build_runtime(config)?;

    if let Some(catalog_file) = &args.catalog_file {
        let bytes = std::fs::read(catalog_file)
            .with_context(|| format!("failed to read {}", catalog_file.display()))?;
        let bundle = serde_json::from_slice(&bytes)
            .with_context(|| format!("{} is not a JSON bundle", catalog_file.display()))?;
        runtime
            .catalog
            .install_bundle(&bundle)
            .map_err(|err| anyhow!("catalog bundle rejected: {}", err))?;
    }

    // Stage the document inside the upload directory, same as the HTTP path.
    let original_name = args
        .file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document")
        .to_string();
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let staged = stage_upload(&runtime.config.storage.upload_dir, &original_name, &bytes)?;

    let request = AnalysisRequest {
        url: None,
        document_path: Some(staged),
        document_name: Some(original_name),
        options: Default::default(),
    };
    let context = runtime
        .engine
        .execute(WORKFLOW_TYPE, AnalysisPayload::Request(request))
        .await
        .map_err(|err| anyhow!("analysis failed to run: {}", err))?;

    match context.status {
        WorkflowStatus::Completed => {
            let report_id = context
                .results
                .get(TASK_REPORT)
                .and_then(|value| value.get("reportId"))
                .and_then(serde_json::Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .ok_or_else(|| anyhow!("completed workflow has no report id"))?;
            let report = runtime
                .store
                .load_report(&report_id)
                .map_err(|err| anyhow!("failed to load report: {}", err))?
                .ok_or_else(|| anyhow!("report {} not found after completion", report_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        status => {
            let detail = context
                .last_error()
                .map(|(task, record)| format!("{}: {}", task, record.message))
                .unwrap_or_else(|| "no error recorded".to_string());
            Err(anyhow!("analysis ended {} ({})", status, detail))
        }
    }
}

pub async fn run_refresh_catalog(args: RefreshCatalogArgs) -> Result<()> {
    let config = load_config(args.config_dir.as_deref())?;
    let runtime = build_runtime(config)?;
    let snapshot = runtime
        .catalog
        .refresh(args.force)
        .await
        .map_err(|err| anyhow!("catalog refresh failed: {}", err))?;
    info!(
        version = %snapshot.version,
        stale = snapshot.stale,
        techniques = snapshot.index.len(),
        "catalog ready"
    );
    println!(
        "catalog version {} ({} techniques{})",
        snapshot.version,
        snapshot.index.len(),
        if snapshot.stale { ", stale" } else { "" }
    );
    Ok(())
}

fn stage_upload(upload_dir: &Path, original_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(upload_dir)
        .with_context(|| format!("failed to create {}", upload_dir.display()))?;
    let sanitized: String = original_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let path = upload_dir.join(format!("{}_{}", Uuid::new_v4(), sanitized));
    std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
