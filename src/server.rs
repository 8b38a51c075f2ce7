//! HTTP boundary: JSON in, `{code, data, msg}` out. Maps pool and task
//! failures onto transport status codes; correlation ids never leave this
//! process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics;
use crate::pool::{OcrPool, SubmitError};
use crate::protocol::{OcrRequest, TaskOutcome, TextLine};

pub struct AppContext {
    pub pool: Arc<OcrPool>,
    pub task_timeout: Duration,
}

/// Wire shape shared by every endpoint response: `code` 0 on success, -1
/// with `msg` on any failure.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<TextLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ApiResponse {
    fn success(data: Vec<TextLine>) -> Self {
        Self {
            code: 0,
            data: Some(data),
            msg: None,
        }
    }

    fn failure(msg: impl Into<String>) -> Self {
        Self {
            code: -1,
            data: None,
            msg: Some(msg.into()),
        }
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/ocr/predict", post(ocr_predict))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler() -> String {
    metrics::export_metrics()
}

async fn ocr_predict(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<OcrRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let started = Instant::now();

    // Boundary validation; the worker re-checks defensively.
    if !request.has_image_source() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failure("no image provided")),
        );
    }

    let pool = ctx.pool.clone();
    let timeout = ctx.task_timeout;
    let submitted = tokio::task::spawn_blocking(move || pool.submit(request, timeout)).await;

    let outcome = match submitted {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "submit task panicked");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failure("internal error")),
            );
        }
    };

    let cost_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(TaskOutcome::Success(lines)) => {
            info!(cost_ms, lines = lines.len(), "ocr_predict ok");
            (StatusCode::OK, Json(ApiResponse::success(lines)))
        }
        Ok(TaskOutcome::Failure(failure)) => {
            let status = StatusCode::from_u16(failure.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            info!(cost_ms, status = status.as_u16(), "ocr_predict failed");
            (status, Json(ApiResponse::failure(failure.message)))
        }
        Err(SubmitError::QueueFull) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::failure("task queue full, retry later")),
        ),
        Err(SubmitError::Timeout) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ApiResponse::failure("OCR request timed out")),
        ),
        Err(SubmitError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::failure("server shutting down")),
        ),
    }
}
