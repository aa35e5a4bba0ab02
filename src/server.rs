//! JSON HTTP API over the parse orchestrator.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version and vendor) |
//! | `GET`  | `/documents` | List documents, newest first |
//! | `POST` | `/documents/{id}/parse` | Request a parse (`{ job_id, status, already_running, resumed }`) |
//! | `GET`  | `/documents/{id}/parse-status` | Document status and latest job |
//! | `GET`  | `/documents/{id}/parsed` | Chunks and blocks of the latest completed job |
//! | `GET`  | `/documents/{id}/facts` | Structured facts of the document |
//! | `GET`  | `/parse-jobs/active` | Poll tasks still running |
//! | `POST` | `/parse-jobs/{id}/cancel` | Cancel a poll task and fail its job |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found: 42" } }
//! ```
//!
//! Error codes: `not_found` (404), `vendor_error` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::ParseError;
use crate::models::{Document, StructuredFact};
use crate::orchestrator::{ActivePoll, NormalizedView, ParseOrchestrator, ParseRequestOutcome, ParseStatus};

/// Build the application router. Split from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(orchestrator: ParseOrchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{id}/parse", post(handle_request_parse))
        .route("/documents/{id}/parse-status", get(handle_parse_status))
        .route("/documents/{id}/parsed", get(handle_parsed))
        .route("/documents/{id}/facts", get(handle_facts))
        .route("/parse-jobs/active", get(handle_active_polls))
        .route("/parse-jobs/{id}/cancel", post(handle_cancel))
        .layer(cors)
        .with_state(orchestrator)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config, orchestrator: ParseOrchestrator) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "HTTP API listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ParseError> for AppError {
    fn from(err: ParseError) -> Self {
        let (status, code) = match &err {
            e if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
            ParseError::Vendor(_) => (StatusCode::BAD_GATEWAY, "vendor_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        ParseError::Store(err).into()
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    vendor: &'static str,
}

async fn handle_health(State(orchestrator): State<ParseOrchestrator>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        vendor: orchestrator.vendor().as_str(),
    })
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(orchestrator): State<ParseOrchestrator>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = orchestrator.store().list_documents().await?;
    Ok(Json(DocumentListResponse { documents }))
}

async fn handle_request_parse(
    State(orchestrator): State<ParseOrchestrator>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ParseRequestOutcome>), AppError> {
    let outcome = orchestrator.request_parse(&id).await?;
    let status = if outcome.already_running {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

async fn handle_parse_status(
    State(orchestrator): State<ParseOrchestrator>,
    Path(id): Path<String>,
) -> Result<Json<ParseStatus>, AppError> {
    Ok(Json(orchestrator.get_parse_status(&id).await?))
}

async fn handle_parsed(
    State(orchestrator): State<ParseOrchestrator>,
    Path(id): Path<String>,
) -> Result<Json<NormalizedView>, AppError> {
    Ok(Json(orchestrator.get_normalized_result(&id).await?))
}

#[derive(Serialize)]
struct FactListResponse {
    facts: Vec<StructuredFact>,
}

async fn handle_facts(
    State(orchestrator): State<ParseOrchestrator>,
    Path(id): Path<String>,
) -> Result<Json<FactListResponse>, AppError> {
    let facts = orchestrator.list_facts(&id).await?;
    Ok(Json(FactListResponse { facts }))
}

#[derive(Serialize)]
struct ActivePollsResponse {
    polls: Vec<ActivePoll>,
}

async fn handle_active_polls(State(orchestrator): State<ParseOrchestrator>) -> Json<ActivePollsResponse> {
    Json(ActivePollsResponse {
        polls: orchestrator.active_polls(),
    })
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    cancelled: bool,
}

async fn handle_cancel(
    State(orchestrator): State<ParseOrchestrator>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = orchestrator.cancel(&id).await?;
    Ok(Json(CancelResponse {
        job_id: id,
        cancelled,
    }))
}
