//! Control HTTP server
//!
//! JSON API over a running queue. `GET /status` serves the latest snapshot;
//! the other routes forward queue commands through a [`QueueHandle`] and map
//! rejections to HTTP status codes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::engine::{QueueError, QueueHandle};
use crate::job::{EncodeJob, EncodeProfile, JobId, RangeSelection, SourceType};
use crate::status::QueueStatus;
use encode_queue_config::Config;

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Request failure returned by a handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::Queue(QueueError::UnknownJob(_)) => (StatusCode::NOT_FOUND, "unknown_job"),
            ApiError::Queue(QueueError::DuplicateJob(_)) => (StatusCode::CONFLICT, "duplicate_job"),
            ApiError::Queue(QueueError::JobIsLive(_)) => (StatusCode::CONFLICT, "job_is_live"),
            ApiError::Queue(QueueError::NotIdle(_)) => (StatusCode::CONFLICT, "not_idle"),
            ApiError::Queue(QueueError::EmptyQueue) => (StatusCode::CONFLICT, "empty_queue"),
            ApiError::Queue(QueueError::InvalidDuration { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_duration")
            }
            ApiError::Queue(QueueError::Persist(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "persist_error")
            }
            ApiError::Queue(QueueError::EngineGone) => {
                (StatusCode::SERVICE_UNAVAILABLE, "engine_gone")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Shared state of the control server.
#[derive(Debug, Clone)]
pub struct ServerState {
    handle: QueueHandle,
    /// File re-read by `POST /config/reload`.
    config_path: Option<PathBuf>,
}

impl ServerState {
    pub fn new(handle: QueueHandle, config_path: Option<PathBuf>) -> Self {
        Self {
            handle,
            config_path,
        }
    }
}

/// Body of `POST /jobs`. Everything but the paths and duration is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub duration_secs: f64,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub title: Option<u32>,
    #[serde(default)]
    pub range: RangeSelection,
    #[serde(default)]
    pub profile: EncodeProfile,
    #[serde(default)]
    pub preset_name: String,
    #[serde(default)]
    pub manual_output_path: bool,
}

impl AddJobRequest {
    fn into_job(self) -> EncodeJob {
        let mut job = EncodeJob::new(self.source_path, self.output_path, self.duration_secs);
        job.source_type = self.source_type;
        if let Some(title) = self.title {
            job.title = title;
        }
        job.range = self.range;
        job.profile = self.profile;
        job.preset_name = self.preset_name;
        job.manual_output_path = self.manual_output_path;
        job
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobResponse {
    pub id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveJobRequest {
    pub index: usize,
}

/// Handler for GET /status
async fn get_status(State(state): State<ServerState>) -> Json<QueueStatus> {
    Json(state.handle.status())
}

async fn add_job(
    State(state): State<ServerState>,
    Json(request): Json<AddJobRequest>,
) -> ApiResult<(StatusCode, Json<AddJobResponse>)> {
    let job = request.into_job();
    let id = job.id;
    state.handle.queue(job).await?;
    Ok((StatusCode::CREATED, Json(AddJobResponse { id })))
}

async fn remove_job(State(state): State<ServerState>, Path(id): Path<JobId>) -> ApiResult<StatusCode> {
    state.handle.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_job(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
    Json(request): Json<MoveJobRequest>,
) -> ApiResult<StatusCode> {
    state.handle.move_job(id, request.index).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    state.handle.start().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    state.handle.pause()?;
    Ok(StatusCode::ACCEPTED)
}

async fn resume(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    state.handle.resume()?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    state.handle.stop()?;
    Ok(StatusCode::ACCEPTED)
}

async fn clear_completed(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    state.handle.clear_completed()?;
    Ok(StatusCode::ACCEPTED)
}

/// Re-read the config file and hand it to the engine. Paths and server
/// settings only change on restart.
async fn reload_config(State(state): State<ServerState>) -> ApiResult<StatusCode> {
    let path = state
        .config_path
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("No config file to reload".to_string()))?;
    let config = Config::load_or_default(path).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.handle.update_config(config)?;
    info!(path = %path.display(), "Reloaded config");
    Ok(StatusCode::ACCEPTED)
}

/// Creates the axum Router with the status and control endpoints
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/jobs", post(add_job))
        .route("/jobs/:id", delete(remove_job))
        .route("/jobs/:id/move", post(move_job))
        .route("/start", post(start))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/clear-completed", post(clear_completed))
        .route("/config/reload", post(reload_config))
        .with_state(state)
}

/// Runs the control server on `bind` until `shutdown` completes.
pub async fn run_server<F>(bind: &str, state: ServerState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: std::net::SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Control server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
