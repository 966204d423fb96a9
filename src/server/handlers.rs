//! HTTP handlers for submission, status, cancellation, and report access.

use crate::core::analysis::{
    validate_submission_url, AnalysisOptions, AnalysisPayload, AnalysisRequest, TASK_REPORT,
    WORKFLOW_TYPE,
};
use crate::core::catalog::CatalogService;
use crate::core::storage::{ReportQuery, ReportSortBy, ReportStore, SortOrder};
use crate::core::types::WorkflowStatus;
use crate::core::workflow::{WorkflowContext, WorkflowEngine};
use crate::server::reject::{success, ApiRejection};
use crate::utils::files::confine_to_dir;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// MIME types accepted for uploaded documents.
const ALLOWED_UPLOAD_MIMES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
    "text/html",
    "text/markdown",
    "application/rtf",
];

pub struct AppState {
    pub engine: Arc<WorkflowEngine<AnalysisPayload>>,
    pub reports: Arc<dyn ReportStore>,
    pub catalog: Arc<CatalogService>,
    pub upload_dir: PathBuf,
    pub max_document_bytes: usize,
}

/// `POST /api/analyze`. One route, two submission shapes discriminated by
/// Content-Type: a JSON body carrying a URL, or a multipart upload.
pub async fn submit_analysis(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiRejection> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("application/json") {
        let bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
            .await
            .map_err(|err| {
                ApiRejection::bad_request("INVALID_BODY", format!("unreadable body: {}", err))
            })?;
        submit_url(state, &bytes).await
    } else if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &()).await.map_err(|err| {
            ApiRejection::bad_request("INVALID_BODY", format!("invalid multipart body: {}", err))
        })?;
        submit_upload(state, multipart).await
    } else {
        Err(ApiRejection::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UNSUPPORTED_MEDIA_TYPE",
            "expected application/json or multipart/form-data",
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UrlSubmission {
    url: String,
    #[serde(default)]
    options: Option<AnalysisOptions>,
}

async fn submit_url(state: Arc<AppState>, body: &[u8]) -> Result<Response, ApiRejection> {
    let submission: UrlSubmission = serde_json::from_slice(body).map_err(|err| {
        ApiRejection::bad_request("INVALID_BODY", format!("invalid JSON submission: {}", err))
    })?;
    validate_submission_url(&submission.url)?;

    let request = AnalysisRequest {
        url: Some(submission.url),
        document_path: None,
        document_name: None,
        options: submission.options.unwrap_or_default(),
    };
    spawn_job(&state, request)
}

async fn submit_upload(
    state: Arc<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiRejection> {
    let mut document: Option<(String, String, Vec<u8>)> = None;
    let mut options: Option<AnalysisOptions> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiRejection::bad_request("INVALID_BODY", format!("multipart read failed: {}", err))
    })? {
        match field.name() {
            Some("document") => {
                let filename = field.file_name().unwrap_or("document").to_string();
                let mime = field.content_type().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(|err| {
                    ApiRejection::bad_request(
                        "INVALID_DOCUMENT",
                        format!("document field unreadable: {}", err),
                    )
                })?;
                document = Some((filename, mime, bytes.to_vec()));
            }
            Some("options") => {
                let text = field.text().await.map_err(|err| {
                    ApiRejection::bad_request(
                        "INVALID_OPTIONS",
                        format!("options field unreadable: {}", err),
                    )
                })?;
                options = Some(serde_json::from_str(&text).map_err(|err| {
                    ApiRejection::bad_request(
                        "INVALID_OPTIONS",
                        format!("options are not valid JSON: {}", err),
                    )
                })?);
            }
            _ => {}
        }
    }

    let Some((filename, mime, bytes)) = document else {
        return Err(ApiRejection::bad_request(
            "INVALID_DOCUMENT",
            "multipart submission is missing the document field",
        ));
    };
    // Size and MIME gate before any workflow is created.
    if bytes.len() > state.max_document_bytes {
        return Err(ApiRejection::bad_request(
            "INVALID_DOCUMENT",
            format!(
                "document is too large: {} bytes exceeds the {} byte cap",
                bytes.len(),
                state.max_document_bytes
            ),
        ));
    }
    if !mime.is_empty() && !ALLOWED_UPLOAD_MIMES.contains(&mime.split(';').next().unwrap_or("")) {
        return Err(ApiRejection::bad_request(
            "UNSUPPORTED_FORMAT",
            format!("unsupported document MIME type '{}'", mime),
        ));
    }

    let stored_name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(&filename));
    let path = confine_to_dir(&state.upload_dir, &stored_name).map_err(|err| {
        warn!("upload confinement rejected {:?}: {}", stored_name, err);
        ApiRejection::from(err)
    })?;
    std::fs::create_dir_all(&state.upload_dir)
        .and_then(|_| std::fs::write(&path, &bytes))
        .map_err(|err| {
            ApiRejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                format!("failed to store upload: {}", err),
            )
        })?;

    let request = AnalysisRequest {
        url: None,
        document_path: Some(path),
        document_name: Some(filename),
        options: options.unwrap_or_default(),
    };
    spawn_job(&state, request)
}

fn spawn_job(state: &Arc<AppState>, request: AnalysisRequest) -> Result<Response, ApiRejection> {
    let (job_id, _handle) =
        WorkflowEngine::spawn(&state.engine, WORKFLOW_TYPE, AnalysisPayload::Request(request))
            .map_err(ApiRejection::from)?;
    info!(job_id = %job_id, "analysis submitted");
    let body = success(json!({
        "jobId": job_id,
        "status": "submitted",
        "statusUrl": format!("/api/analyze/{}", job_id),
    }));
    Ok((StatusCode::ACCEPTED, body).into_response())
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// `GET /api/analyze/{jobId}`.
pub async fn get_analysis_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiRejection> {
    let job_id = parse_job_id(&job_id)?;
    let context = state
        .engine
        .get_context(&job_id)
        .map_err(ApiRejection::from)?
        .ok_or_else(|| ApiRejection::not_found(format!("unknown job {}", job_id)))?;
    Ok(Json(status_body(&state, &context)))
}

fn status_body(state: &Arc<AppState>, context: &WorkflowContext) -> Value {
    let total_tasks = state
        .engine
        .definition(&context.workflow_type)
        .map(|d| d.task_count())
        .unwrap_or(1)
        .max(1);
    let completed = context.completed_task_count();
    let running_bonus = if context.status == WorkflowStatus::Running
        && context.current_task.is_some()
    {
        0.5
    } else {
        0.0
    };
    let progress =
        (((completed as f64 + running_bonus) / total_tasks as f64) * 100.0).floor() as u64;
    let elapsed_ms = if context.status.is_terminal() {
        (context.updated_at - context.started_at).num_milliseconds()
    } else {
        (Utc::now() - context.started_at).num_milliseconds()
    }
    .max(0);

    let mut body = json!({
        "jobId": context.workflow_id,
        "status": context.status.as_str(),
        "progress": progress.min(100),
        "currentStep": context.current_task,
        "startTime": context.started_at,
        "elapsedTimeMs": elapsed_ms,
    });
    if let Some(report_id) = context
        .results
        .get(TASK_REPORT)
        .and_then(|value| value.get("reportId"))
        .and_then(Value::as_str)
    {
        body["reportId"] = json!(report_id);
        body["reportUrl"] = json!(format!("/api/reports/{}", report_id));
    }
    if let Some((_, record)) = context.last_error() {
        body["error"] = json!({
            "code": record.code,
            "message": record.message,
        });
    }
    body
}

/// `DELETE /api/analyze/{jobId}` — cancel a pending or running job.
pub async fn cancel_analysis(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiRejection> {
    let job_id = parse_job_id(&job_id)?;
    let Some(context) = state
        .engine
        .get_context(&job_id)
        .map_err(ApiRejection::from)?
    else {
        return Err(ApiRejection::not_found(format!("unknown job {}", job_id)));
    };
    let canceled = state.engine.cancel(&job_id).map_err(ApiRejection::from)?;
    let status = if canceled {
        WorkflowStatus::Canceled
    } else {
        context.status
    };
    Ok(success(json!({
        "jobId": job_id,
        "canceled": canceled,
        "status": status.as_str(),
    })))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiRejection> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiRejection::bad_request("INVALID_JOB_ID", format!("'{}' is not a valid job id", raw))
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportListParams {
    page: usize,
    limit: usize,
    date_from: Option<String>,
    date_to: Option<String>,
    url: Option<String>,
    min_matches: Option<usize>,
    /// Comma-separated technique ids.
    techniques: Option<String>,
    /// Comma-separated tactic short-names.
    tactics: Option<String>,
    sort_by: Option<String>,
    sort_order: Option<String>,
}

impl Default for ReportListParams {
    fn default() -> Self {
        ReportListParams {
            page: 1,
            limit: 20,
            date_from: None,
            date_to: None,
            url: None,
            min_matches: None,
            techniques: None,
            tactics: None,
            sort_by: None,
            sort_order: None,
        }
    }
}

fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiRejection> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(naive) = time {
            return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    Err(ApiRejection::bad_request(
        "INVALID_QUERY",
        format!("'{}' is not a valid date", raw),
    ))
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ReportListParams {
    fn into_query(self) -> Result<ReportQuery, ApiRejection> {
        if self.limit == 0 || self.limit > 100 {
            return Err(ApiRejection::bad_request(
                "INVALID_QUERY",
                "limit must be between 1 and 100",
            ));
        }
        let sort_by = match self.sort_by.as_deref() {
            None | Some("timestamp") => ReportSortBy::Timestamp,
            Some("url") => ReportSortBy::Url,
            Some("matchCount") => ReportSortBy::MatchCount,
            Some(other) => {
                return Err(ApiRejection::bad_request(
                    "INVALID_QUERY",
                    format!("unknown sortBy value '{}'", other),
                ))
            }
        };
        let sort_order = match self.sort_order.as_deref() {
            None | Some("desc") => SortOrder::Desc,
            Some("asc") => SortOrder::Asc,
            Some(other) => {
                return Err(ApiRejection::bad_request(
                    "INVALID_QUERY",
                    format!("unknown sortOrder value '{}'", other),
                ))
            }
        };
        Ok(ReportQuery {
            page: self.page.max(1),
            limit: self.limit,
            date_from: self
                .date_from
                .as_deref()
                .map(|raw| parse_date(raw, false))
                .transpose()?,
            date_to: self
                .date_to
                .as_deref()
                .map(|raw| parse_date(raw, true))
                .transpose()?,
            url_contains: self.url,
            min_matches: self.min_matches,
            techniques: split_csv(&self.techniques),
            tactics: split_csv(&self.tactics),
            sort_by,
            sort_order,
        })
    }
}

/// `GET /api/reports`.
pub async fn list_reports(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReportListParams>,
) -> Result<Json<Value>, ApiRejection> {
    let query = params.into_query()?;
    let page = state.reports.list_reports(&query).map_err(ApiRejection::from)?;
    Ok(success(page))
}

/// `GET /api/reports/{id}`.
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
) -> Result<Json<Value>, ApiRejection> {
    let report_id = parse_report_id(&report_id)?;
    let report = state
        .reports
        .load_report(&report_id)
        .map_err(ApiRejection::from)?
        .ok_or_else(|| ApiRejection::not_found(format!("unknown report {}", report_id)))?;
    Ok(success(report))
}

/// `DELETE /api/reports/{id}` — removes the report and its matches.
pub async fn delete_report(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
) -> Result<Json<Value>, ApiRejection> {
    let report_id = parse_report_id(&report_id)?;
    let deleted = state
        .reports
        .delete_report(&report_id)
        .map_err(ApiRejection::from)?;
    if !deleted {
        return Err(ApiRejection::not_found(format!(
            "unknown report {}",
            report_id
        )));
    }
    Ok(success(json!({"deleted": true})))
}

fn parse_report_id(raw: &str) -> Result<Uuid, ApiRejection> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiRejection::bad_request(
            "INVALID_REPORT_ID",
            format!("'{}' is not a valid report id", raw),
        )
    })
}
