#![allow(clippy::result_large_err)]

//! The four document-analysis task handlers.

use crate::core::analysis::extract::{detect_format, ExtractorRegistry};
use crate::core::analysis::payload::{
    AnalysisPayload, AnalysisRequest, CatalogRef, DocumentBundle, DocumentMetadata,
    PreparedDocument, ReportRef,
};
use crate::core::catalog::CatalogService;
use crate::core::config::AnalysisConfig;
use crate::core::error::AppError;
use crate::core::matching::fuzzy::FuzzyMatcher;
use crate::core::matching::keyword::KeywordMatcher;
use crate::core::matching::tfidf::TfidfMatcher;
use crate::core::matching::{
    fuse_matches, EvalResult, EvalSummary, FusionOptions, Matcher, RawMatch,
};
use crate::core::report::{build_report, SourceDescriptor};
use crate::core::storage::ReportStore;
use crate::core::text::{chunk_text, normalize, ChunkOptions};
use crate::core::types::ErrorCategory;
use crate::core::workflow::{TaskContext, TaskHandler, TaskPayload};
use crate::utils::files::sha256_hex;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use url::Url;

pub const TASK_PREPARE: &str = "prepare-document";
pub const TASK_CATALOG: &str = "get-mitre-data";
pub const TASK_EVALUATE: &str = "evaluate-document";
pub const TASK_REPORT: &str = "generate-report";

/// Shared collaborators injected into every task handler.
pub struct AnalysisDeps {
    pub http: reqwest::Client,
    pub catalog: Arc<CatalogService>,
    pub extractors: ExtractorRegistry,
    pub report_store: Arc<dyn ReportStore>,
    pub settings: AnalysisConfig,
    pub upload_dir: PathBuf,
}

/// Validate a submission URL: parseable, http(s), non-local host, and free of
/// characters that have no business in a fetchable URL.
pub fn validate_submission_url(raw: &str) -> Result<Url, AppError> {
    const FORBIDDEN: &[char] = &['<', '>', '{', '}', '|', '\\', '^', '`'];
    if raw.chars().any(|c| c.is_whitespace() || FORBIDDEN.contains(&c)) {
        return Err(AppError::new(
            ErrorCategory::InvalidUrl,
            "url contains forbidden characters",
        )
        .with_code("DOC-URL-001"));
    }
    let url = Url::parse(raw).map_err(|err| {
        AppError::new(ErrorCategory::InvalidUrl, format!("url does not parse: {}", err))
            .with_code("DOC-URL-002")
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::new(
            ErrorCategory::InvalidUrl,
            format!("unsupported url scheme '{}'", url.scheme()),
        )
        .with_code("DOC-URL-003"));
    }
    match url.host_str() {
        None => {
            return Err(
                AppError::new(ErrorCategory::InvalidUrl, "url has no host")
                    .with_code("DOC-URL-004"),
            )
        }
        Some(host) if host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" => {
            return Err(AppError::new(
                ErrorCategory::InvalidUrl,
                "local hosts are not fetchable",
            )
            .with_code("DOC-URL-005"))
        }
        Some(_) => {}
    }
    Ok(url)
}

/// prepare-document: resolve the source, extract, normalize, chunk.
pub struct PrepareDocument {
    pub deps: Arc<AnalysisDeps>,
}

impl PrepareDocument {
    async fn fetch_document(&self, url: &Url) -> Result<(Vec<u8>, Option<String>), AppError> {
        let response = self.deps.http.get(url.as_str()).send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AppError::new(
                ErrorCategory::RateLimited,
                format!("source rate limited the fetch of {}", url),
            )
            .with_code("DOC-FETCH-429"));
        }
        if status.is_server_error() {
            return Err(AppError::new(
                ErrorCategory::UpstreamServerError,
                format!("source server responded with a {} for {}", status.as_u16(), url),
            )
            .with_code("DOC-FETCH-5XX"));
        }
        if !status.is_success() {
            return Err(AppError::new(
                ErrorCategory::FetchError,
                format!("fetch of {} failed with status {}", url, status.as_u16()),
            )
            .with_code("DOC-FETCH-001"));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        self.check_size(bytes.len())?;
        Ok((bytes, mime))
    }

    fn read_upload(&self, path: &Path) -> Result<Vec<u8>, AppError> {
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || !path.starts_with(&self.deps.upload_dir);
        if escapes {
            warn!(path = %path.display(), "rejected upload path outside the upload directory");
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "document path escapes the upload directory",
            )
            .with_code("DOC-PATH-001"));
        }
        let bytes = std::fs::read(path)?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    fn check_size(&self, len: usize) -> Result<(), AppError> {
        if len > self.deps.settings.max_document_bytes {
            return Err(AppError::new(
                ErrorCategory::OversizedDocument,
                format!(
                    "document is too large: {} bytes exceeds the {} byte cap",
                    len, self.deps.settings.max_document_bytes
                ),
            )
            .with_code("DOC-SIZE-001"));
        }
        Ok(())
    }

    fn build_bundle(
        &self,
        bytes: &[u8],
        mime: Option<&str>,
        request: &AnalysisRequest,
    ) -> Result<DocumentBundle, AppError> {
        let filename = request
            .document_name
            .as_deref()
            .or_else(|| {
                request
                    .document_path
                    .as_deref()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
            });
        let format = detect_format(mime, filename, bytes);
        let extractor = self.deps.extractors.get(format).ok_or_else(|| {
            AppError::new(
                ErrorCategory::UnsupportedFormat,
                format!("no extractor registered for {}", format),
            )
            .with_code("DOC-FORMAT-001")
        })?;
        let extracted = extractor.extract(bytes)?;
        let text = normalize(&extracted);
        let chunks = chunk_text(
            &text,
            &ChunkOptions {
                max_chunk_size: self.deps.settings.chunk_size,
                overlap: self.deps.settings.chunk_overlap,
                preserve_headers: self.deps.settings.preserve_headers,
            },
        );
        let content_hash = sha256_hex(text.as_bytes());
        Ok(DocumentBundle {
            metadata: DocumentMetadata {
                char_count: text.chars().count(),
                format,
                source_url: request.url.clone(),
                source_filename: filename.map(str::to_string),
            },
            chunks,
            content_hash,
            text,
        })
    }
}

#[async_trait]
impl TaskHandler<AnalysisPayload> for PrepareDocument {
    async fn run(
        &self,
        ctx: &TaskContext,
        input: AnalysisPayload,
    ) -> Result<AnalysisPayload, AppError> {
        let request = match input {
            AnalysisPayload::Request(request) => request,
            other => return Err(unexpected_payload(TASK_PREPARE, other.kind())),
        };

        let (bytes, mime) = match (&request.url, &request.document_path) {
            (Some(raw_url), _) => {
                let url = validate_submission_url(raw_url)?;
                self.fetch_document(&url).await?
            }
            (None, Some(path)) => (self.read_upload(path)?, None),
            (None, None) => {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    "submission carries neither a url nor a document path",
                )
                .with_code("DOC-INPUT-001"));
            }
        };

        let bundle = self.build_bundle(&bytes, mime.as_deref(), &request)?;
        info!(
            workflow_id = %ctx.workflow_id,
            format = %bundle.metadata.format,
            chars = bundle.metadata.char_count,
            chunks = bundle.chunks.len(),
            "document prepared"
        );
        Ok(AnalysisPayload::Document(PreparedDocument {
            bundle,
            options: request.options,
        }))
    }
}

/// get-mitre-data: serve the cached catalog, refreshing when aged out.
pub struct GetMitreData {
    pub deps: Arc<AnalysisDeps>,
}

#[async_trait]
impl TaskHandler<AnalysisPayload> for GetMitreData {
    async fn run(
        &self,
        _ctx: &TaskContext,
        _input: AnalysisPayload,
    ) -> Result<AnalysisPayload, AppError> {
        let snapshot = self.deps.catalog.snapshot().await?;
        Ok(AnalysisPayload::Catalog(CatalogRef {
            version: snapshot.version.clone(),
            stale: snapshot.stale,
        }))
    }
}

/// evaluate-document: per-chunk matching across enabled matchers, fusion,
/// confidence floor and result cap.
pub struct EvaluateDocument {
    pub deps: Arc<AnalysisDeps>,
}

impl EvaluateDocument {
    fn matchers(
        &self,
        index: &crate::core::catalog::TechniqueIndex,
    ) -> Vec<Box<dyn Matcher>> {
        let settings = &self.deps.settings;
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if settings.enable_keyword {
            matchers.push(Box::new(KeywordMatcher::new(index)));
        }
        if settings.enable_tfidf {
            matchers.push(Box::new(TfidfMatcher::new(index)));
        }
        if settings.enable_fuzzy {
            matchers.push(Box::new(FuzzyMatcher::new(index)));
        }
        matchers
    }
}

#[async_trait]
impl TaskHandler<AnalysisPayload> for EvaluateDocument {
    async fn run(
        &self,
        ctx: &TaskContext,
        input: AnalysisPayload,
    ) -> Result<AnalysisPayload, AppError> {
        let prepared = expect_document(input.join_member(TASK_PREPARE))?;
        let catalog_ref = expect_catalog(input.join_member(TASK_CATALOG))?;

        // Resolve exactly the version the predecessor task observed, so a
        // concurrent refresh never mixes versions mid-workflow.
        let snapshot = match self.deps.catalog.pinned(&catalog_ref.version) {
            Some(snapshot) => snapshot,
            None => self.deps.catalog.snapshot().await?,
        };

        let started = Instant::now();
        let matchers = self.matchers(&snapshot.index);
        let bundle = &prepared.bundle;
        let mut raw: Vec<RawMatch> = Vec::new();
        for chunk in &bundle.chunks {
            for matcher in &matchers {
                for mut m in matcher.find_matches(&chunk.text) {
                    m.start_char += chunk.start_char;
                    m.end_char += chunk.start_char;
                    raw.push(m);
                }
            }
        }

        let fused = fuse_matches(
            &raw,
            &bundle.text,
            &FusionOptions {
                context_window: self.deps.settings.context_window,
            },
        );

        let min_confidence = prepared
            .options
            .min_confidence
            .unwrap_or(self.deps.settings.min_confidence);
        let mut matches: Vec<_> = fused
            .into_iter()
            .filter(|m| m.score >= min_confidence)
            .collect();
        if let Some(tactics) = &prepared.options.include_tactics {
            if !tactics.is_empty() {
                matches.retain(|m| m.tactics.iter().any(|t| tactics.contains(t)));
            }
        }
        matches.truncate(self.deps.settings.max_matches);

        let summary = EvalSummary::from_matches(
            bundle.content_hash.clone(),
            &matches,
            started.elapsed().as_millis() as u64,
        );
        info!(
            workflow_id = %ctx.workflow_id,
            matches = matches.len(),
            catalog_version = %catalog_ref.version,
            "document evaluated"
        );
        Ok(AnalysisPayload::Evaluation(EvalResult { matches, summary }))
    }
}

/// generate-report: assemble the summary and persist report + matches
/// atomically.
pub struct GenerateReport {
    pub deps: Arc<AnalysisDeps>,
}

#[async_trait]
impl TaskHandler<AnalysisPayload> for GenerateReport {
    async fn run(
        &self,
        ctx: &TaskContext,
        input: AnalysisPayload,
    ) -> Result<AnalysisPayload, AppError> {
        let prepared = expect_document(input.join_member(TASK_PREPARE))?;
        let eval = expect_evaluation(input.join_member(TASK_EVALUATE))?;
        let catalog_ref = expect_catalog(input.join_member(TASK_CATALOG))?;

        let mut eval = eval.clone();
        let max_results = prepared.options.max_results.unwrap_or(20).max(1);
        if eval.matches.len() > max_results {
            eval.matches.truncate(max_results);
            eval.summary = EvalSummary::from_matches(
                eval.summary.document_id.clone(),
                &eval.matches,
                eval.summary.processing_time_ms,
            );
        }

        let source = SourceDescriptor {
            url: ctx.metadata.source_url.clone(),
            filename: ctx.metadata.source_filename.clone(),
        };
        let report = build_report(&eval, &source, ctx.workflow_id, &catalog_ref.version);
        self.deps.report_store.insert_report(&report)?;
        info!(
            workflow_id = %ctx.workflow_id,
            report_id = %report.id,
            matches = report.summary.match_count,
            "report persisted"
        );
        Ok(AnalysisPayload::Report(ReportRef {
            report_id: report.id,
        }))
    }
}

fn unexpected_payload(task: &str, kind: &str) -> AppError {
    AppError::new(
        ErrorCategory::SchemaMismatch,
        format!("task '{}' received unexpected '{}' payload", task, kind),
    )
    .with_code("DOC-SCHEMA-001")
}

fn expect_document(payload: Option<&AnalysisPayload>) -> Result<&PreparedDocument, AppError> {
    match payload {
        Some(AnalysisPayload::Document(prepared)) => Ok(prepared),
        _ => Err(AppError::new(
            ErrorCategory::SchemaMismatch,
            "prepared document payload missing from task input",
        )
        .with_code("DOC-SCHEMA-002")),
    }
}

fn expect_catalog(payload: Option<&AnalysisPayload>) -> Result<&CatalogRef, AppError> {
    match payload {
        Some(AnalysisPayload::Catalog(catalog)) => Ok(catalog),
        _ => Err(AppError::new(
            ErrorCategory::SchemaMismatch,
            "catalog payload missing from task input",
        )
        .with_code("DOC-SCHEMA-003")),
    }
}

fn expect_evaluation(payload: Option<&AnalysisPayload>) -> Result<&EvalResult, AppError> {
    match payload {
        Some(AnalysisPayload::Evaluation(eval)) => Ok(eval),
        _ => Err(AppError::new(
            ErrorCategory::SchemaMismatch,
            "evaluation payload missing from task input",
        )
        .with_code("DOC-SCHEMA-004")),
    }
}
