//! Route handlers.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::{error_response, AppState};
use crate::models::{timestamp_now, BuildRequest};
use crate::orchestrator::{ArtifactStream, CompileOutcome};

pub async fn health(State(state): State<AppState>) -> Response {
    let workspace = state.orchestrator.status_snapshot().await;
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp_now(),
        "serverPort": state.port,
        "environment": state.deployment,
        "workspace": workspace,
    }))
    .into_response()
}

pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn artifact_response(stream: ArtifactStream) -> Response {
    let content_type = stream.content_type;
    let disposition = stream.content_disposition();
    let length = stream.length;
    let body = Body::from_stream(ReaderStream::new(stream.into_reader()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, length)
        .body(body)
        .unwrap_or_else(|e| {
            log::error!("[Http] Failed to build artifact response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to stream firmware binary")
        })
}

pub async fn compile(
    State(state): State<AppState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            log::warn!("[Http] Rejected compile body: {}", rejection.body_text());
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    log::info!(
        "[Http] Compile request {} ({} bytes of source{})",
        request.correlation_id,
        request.source_text.len(),
        if request.is_warmup { ", warm-up" } else { "" }
    );

    match state.orchestrator.compile(request).await {
        Ok(CompileOutcome::Artifact(stream)) => artifact_response(stream),
        Ok(CompileOutcome::Warmup(report)) => Json(report).into_response(),
        Err(e) => {
            log::error!("[Http] Compile failed: {}", e);
            e.into_response()
        }
    }
}

pub async fn update_firmware(State(state): State<AppState>) -> Response {
    log::info!("[Http] Firmware update requested");
    match state.orchestrator.synchronize().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}
