//! HTTP job intake.
//!
//! `POST /run` (and its `/runsync` alias) always answers `200` with the
//! job envelope; callers never see a transport-level failure for a job
//! that was accepted.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use rooper_core::job::{JobRequest, JobResponse, JobResult};

use crate::handler::JobHandler;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<JobHandler>,
    /// Cancelled on shutdown; each job waits on a child of it.
    pub shutdown: CancellationToken,
}

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /run
///
/// The body is parsed here rather than through the `Json` extractor so a
/// malformed request still gets the `{error}` envelope.
async fn run_job(State(state): State<AppState>, body: Bytes) -> Json<JobResponse> {
    let request: JobRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected malformed job request");
            return Json(JobResult::failure(format!("Invalid job request: {e}")).into_response());
        }
    };

    let cancel = state.shutdown.child_token();
    let result = state.handler.handle(request, &cancel).await;
    Json(result.into_response())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/run", post(run_job))
        .route("/runsync", post(run_job))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
