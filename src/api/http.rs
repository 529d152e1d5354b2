//! HTTP API Server
//!
//! REST surface for starting, stopping, checking and inspecting jobs.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ApiConfig, JobConfiguration};
use crate::error::{Error, Result};
use crate::job::JobCoordinator;

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, coordinator: Arc<JobCoordinator>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { coordinator }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/jobs", get(handle_list).post(handle_start))
            .route("/jobs/:id", get(handle_items).delete(handle_drop))
            .route("/jobs/:id/start", post(handle_resume))
            .route("/jobs/:id/stop", post(handle_stop))
            .route("/jobs/:id/commit", post(handle_commit))
            .route("/jobs/:id/check", get(handle_check_status).post(handle_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state);
        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Response to a job start
#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub id: String,
}

/// Response to an operation without a payload
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl AckResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> Response {
    let (status, code) = match &e {
        Error::JobNotFound(_) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
        Error::JobAlreadyExists(_) => (StatusCode::CONFLICT, "JOB_ALREADY_EXISTS"),
        Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
        Error::CheckInProgress(_) => (StatusCode::CONFLICT, "CHECK_IN_PROGRESS"),
        Error::CheckFailed { .. } => (StatusCode::CONFLICT, "CHECK_FAILED"),
        e if e.is_configuration() => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("API request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse { healthy: true })
}

async fn handle_list(State(state): State<Arc<AppState>>) -> Response {
    respond(StatusCode::OK, state.coordinator.list().await)
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    Json(config): Json<JobConfiguration>,
) -> Response {
    let result = state.coordinator.start(config).await;
    respond(StatusCode::CREATED, result.map(|id| StartResponse { id }))
}

async fn handle_items(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.coordinator.items(&id).await)
}

async fn handle_resume(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.coordinator.resume(&id).await;
    respond(StatusCode::OK, result.map(|_| AckResponse::ok("started")))
}

async fn handle_stop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.coordinator.stop(&id).await;
    respond(StatusCode::OK, result.map(|_| AckResponse::ok("stopped")))
}

async fn handle_commit(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.coordinator.commit(&id).await;
    respond(StatusCode::OK, result.map(|_| AckResponse::ok("finished")))
}

async fn handle_drop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.coordinator.drop_job(&id).await;
    respond(StatusCode::OK, result.map(|_| AckResponse::ok("dropped")))
}

async fn handle_check(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.coordinator.check(&id).await;
    respond(StatusCode::ACCEPTED, result.map(|_| AckResponse::ok("check started")))
}

async fn handle_check_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.check_status(&id).await {
        Ok(Some(status)) => (StatusCode::OK, Json(status)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No consistency check recorded for job {}", id),
                code: "CHECK_NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
