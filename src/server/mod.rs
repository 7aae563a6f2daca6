//! HTTP surface.
//!
//! Thin axum layer over the orchestration facade:
//!
//! - `GET  /health`          liveness plus workspace state
//! - `POST /compile`         `{userCode, pipUUID, isWarmup?}` -> firmware binary or warm-up report
//! - `POST /update-firmware` re-synchronize the workspace from the tracked branch
//!
//! Every response carries permissive CORS headers; `OPTIONS` on the POST
//! routes answers preflight requests.

pub mod handlers;

use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use tokio::net::TcpListener;

use crate::error::OrchestratorError;
use crate::models::{timestamp_now, DeploymentEnvironment};
use crate::orchestrator::Orchestrator;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub port: u16,
    pub deployment: DeploymentEnvironment,
}

/// JSON body for every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorBody {
            success: false,
            error: error.into(),
            timestamp: timestamp_now(),
        }
    }
}

/// Respond with `status` and an `ErrorBody`.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.user_message())
    }
}

async fn apply_cors<B>(mut response: Response<B>) -> Response<B> {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/compile",
            post(handlers::compile).options(handlers::preflight),
        )
        .route(
            "/update-firmware",
            post(handlers::update_firmware).options(handlers::preflight),
        )
        .layer(middleware::map_response(apply_cors))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("[Http] Listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
