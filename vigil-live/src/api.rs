//! HTTP API for the dashboard
//!
//! - `GET /api/alerts?limit=N` - alert history, newest first
//! - `DELETE /api/alerts` - clear the alert history
//! - `GET /api/users`, `POST /api/users` - list / create profiles
//! - `DELETE /api/users` - remove every profile
//! - `GET|PUT|DELETE /api/users/:id` - one profile
//! - `GET /api/stats` - pipeline, broadcast and gateway counters
//! - `GET /health` - liveness
//! - `/uploads/...` - stored attachments (static)
//!
//! Profile media is sent inline as base64 and written to the profile blob
//! area before the record that references it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::broadcast::BroadcastStats;
use crate::config::AppConfig;
use crate::gateway::{GatewayStats, SessionGateway};
use crate::pipeline::{IngestPipeline, PipelineStats};
use crate::storage::{
    Alert, AlertRepository, BlobStore, NewUser, RepositoryError, StorageError, UserProfile,
    UserStore,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub alerts: Arc<AlertRepository>,
    pub users: Arc<UserStore>,
    pub profile_blobs: BlobStore,
    pub pipeline: IngestPipeline,
    pub gateway: SessionGateway,
    pub config: Arc<AppConfig>,
}

/// Handler failures, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => ApiError::NotFound(format!("record {id}")),
            other => ApiError::Repository(other),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Repository(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Dashboards are served from a different origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let uploads = ServeDir::new(&state.config.storage.uploads_dir);
    let prefix = state.config.storage.public_prefix.trim_end_matches('/').to_string();

    let router = Router::new()
        .route("/api/alerts", get(list_alerts).delete(purge_alerts))
        .route("/api/users", get(list_users).post(create_user).delete(delete_all_users))
        .route(
            "/api/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/api/stats", get(stats_handler))
        .route("/health", get(health_check));

    let router = if prefix.is_empty() {
        router.fallback_service(uploads)
    } else {
        router.nest_service(&prefix, uploads)
    };

    router.layer(cors).with_state(state)
}

/// Serve the API on `listener` until shutdown.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP API listening on {addr}");
    }
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

/// GET /api/alerts
async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let limit = query.limit.or(state.config.http.default_alert_limit);
    Ok(Json(state.alerts.list_recent(limit)?))
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

/// DELETE /api/alerts
///
/// Snapshot files are left to the orphan sweep.
async fn purge_alerts(State(state): State<AppState>) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state.alerts.purge()?;
    log::info!("Purged {deleted} alerts");
    Ok(Json(DeletedResponse { deleted }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub alerts: usize,
    pub pipeline: PipelineStats,
    pub broadcast: BroadcastStats,
    pub gateway: GatewayStats,
}

/// GET /api/stats
async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        alerts: state.alerts.count()?,
        pipeline: state.pipeline.stats(),
        broadcast: state.gateway.broadcaster().stats().await,
        gateway: state.gateway.stats().await,
    }))
}

/// Inline media attachment.
#[derive(Debug, Deserialize)]
pub struct MediaUpload {
    /// Base64 content, optionally as a `data:` URL
    pub data: String,
    /// Original file name; only its extension is kept
    #[serde(default)]
    pub filename: Option<String>,
}

/// Body of `POST /api/users` and `PUT /api/users/:id`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub name: String,
    #[serde(default)]
    pub is_present: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub photo: Option<MediaUpload>,
    #[serde(default)]
    pub voice: Option<MediaUpload>,
}

impl UserRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::BadRequest("name is required".into()));
        }
        Ok(())
    }
}

async fn store_media(
    blobs: &BlobStore,
    upload: &MediaUpload,
    fallback_extension: &str,
) -> Result<String, ApiError> {
    let body = match upload.data.split_once(";base64,") {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => upload.data.as_str(),
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| ApiError::BadRequest(format!("media is not valid base64: {e}")))?;
    let extension = upload
        .filename
        .as_deref()
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .unwrap_or(fallback_extension);
    Ok(blobs.save(&bytes, extension).await?)
}

/// GET /api/users
async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<UserProfile>>, ApiError> {
    Ok(Json(state.users.list()?))
}

/// GET /api/users/:id
async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<UserProfile>, ApiError> {
    match state.users.get(id) {
        Ok(user) => Ok(Json(user)),
        Err(RepositoryError::NotFound(_)) => Err(ApiError::NotFound(format!("user {id}"))),
        Err(e) => Err(e.into()),
    }
}

/// POST /api/users
async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;

    let photo = match &req.photo {
        Some(upload) => Some(store_media(&state.profile_blobs, upload, "jpg").await?),
        None => None,
    };
    let voice = match &req.voice {
        Some(upload) => Some(store_media(&state.profile_blobs, upload, "wav").await?),
        None => None,
    };

    let user = state.users.create(NewUser {
        name: req.name,
        is_present: req.is_present,
        role: req.role,
        phone: req.phone,
        email: req.email,
        photo,
        voice,
    })?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// PUT /api/users/:id
///
/// Media fields left out of the body keep their current files.
async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<UserRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    req.validate()?;
    let existing = match state.users.get(id) {
        Ok(user) => user,
        Err(RepositoryError::NotFound(_)) => return Err(ApiError::NotFound(format!("user {id}"))),
        Err(e) => return Err(e.into()),
    };

    // Replaced files are left to the sweep
    let photo = match &req.photo {
        Some(upload) => Some(store_media(&state.profile_blobs, upload, "jpg").await?),
        None => existing.photo,
    };
    let voice = match &req.voice {
        Some(upload) => Some(store_media(&state.profile_blobs, upload, "wav").await?),
        None => existing.voice,
    };

    let user = state.users.update(
        id,
        NewUser {
            name: req.name,
            is_present: req.is_present,
            role: req.role,
            phone: req.phone,
            email: req.email,
            photo,
            voice,
        },
    )?;
    Ok(Json(user))
}

/// DELETE /api/users/:id
async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.users.delete(id) {
        Ok(_) => Ok(Json(serde_json::json!({ "message": "User deleted successfully" }))),
        Err(RepositoryError::NotFound(_)) => Err(ApiError::NotFound(format!("user {id}"))),
        Err(e) => Err(e.into()),
    }
}

/// DELETE /api/users
async fn delete_all_users(State(state): State<AppState>) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state.users.delete_all()?;
    log::info!("Deleted {deleted} user profiles");
    Ok(Json(DeletedResponse { deleted }))
}
