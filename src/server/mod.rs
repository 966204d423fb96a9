#![allow(clippy::result_large_err)]

//! HTTP surface: submission, status polling, report access.

pub mod handlers;
pub mod reject;

pub use handlers::AppState;

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::util::MapResponseLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_document_bytes + 1024 * 1024;
    Router::new()
        .route("/api/analyze", post(handlers::submit_analysis))
        .route(
            "/api/analyze/{job_id}",
            get(handlers::get_analysis_status).delete(handlers::cancel_analysis),
        )
        .route("/api/reports", get(handlers::list_reports))
        .route(
            "/api/reports/{report_id}",
            get(handlers::get_report).delete(handlers::delete_report),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(MapResponseLayer::new(|mut response: Response<Body>| {
            if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
                let body = json!({
                    "success": false,
                    "error": {
                        "code": "INVALID_DOCUMENT",
                        "message": "payload too large"
                    }
                })
                .to_string();
                *response.body_mut() = Body::from(body);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            response
        }))
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the process stops.
pub async fn serve(state: Arc<AppState>, bind: SocketAddr) -> Result<(), AppError> {
    serve_with_ready_notifier(state, bind, None).await
}

/// Serve, reporting the bound address once listening. Port 0 binds pick a
/// free port; the notifier carries the real one back to the caller.
pub async fn serve_with_ready_notifier(
    state: Arc<AppState>,
    bind: SocketAddr,
    ready_notifier: Option<oneshot::Sender<SocketAddr>>,
) -> Result<(), AppError> {
    let router = router(state);
    let listener = TcpListener::bind(bind).await.map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to bind listener {}: {}", bind, err),
        )
        .with_code("API-BIND-001")
    })?;
    let local_addr = listener.local_addr().map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to determine listener address: {}", err),
        )
    })?;
    if let Some(tx) = ready_notifier {
        let _ = tx.send(local_addr);
    }
    info!("api server listening on {}", local_addr);
    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| {
            AppError::new(
                ErrorCategory::InternalError,
                format!("api server terminated: {}", err),
            )
        })
}
