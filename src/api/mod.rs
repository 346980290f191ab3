use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::backup::manager::BackupStatus;
use crate::backup::scheduler::StartOutcome;
use crate::backup::{BackupManager, JobId};
use crate::error::ZipBackupError;
use crate::preferences::SettingsPatch;

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/status", get(get_status))
        .route("/backup", post(start_backup))
        .route("/preferences", get(get_preferences).put(update_preferences))
        .route("/preferences/reset", post(reset_preferences))
        .route("/logs", get(get_logs))
        .route("/history", get(get_history))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct BackupStarted {
    job: Option<JobId>,
    started: bool,
}

/// Maps pipeline errors onto HTTP status codes.
pub struct ApiError(ZipBackupError);

impl From<ZipBackupError> for ApiError {
    fn from(e: ZipBackupError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ZipBackupError::AlreadyRunning => StatusCode::CONFLICT,
            ZipBackupError::EnvironmentUnavailable
            | ZipBackupError::HostNotReady
            | ZipBackupError::ControlLoopStopped => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_configuration() => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn get_status(State(manager): State<BackupManager>) -> Json<BackupStatus> {
    Json(manager.get_status())
}

pub async fn start_backup(State(manager): State<BackupManager>) -> Result<impl IntoResponse, ApiError> {
    let body = match manager.backup_now().await? {
        StartOutcome::Started(job) => BackupStarted {
            job: Some(job),
            started: true,
        },
        StartOutcome::SpawnFailed => BackupStarted {
            job: None,
            started: false,
        },
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn get_preferences(State(manager): State<BackupManager>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(manager.preferences().await?))
}

pub async fn update_preferences(
    State(manager): State<BackupManager>,
    Json(patch): Json<SettingsPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(manager.update_preferences(patch).await?))
}

pub async fn reset_preferences(State(manager): State<BackupManager>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(manager.reset_preferences().await?))
}

pub async fn get_logs(State(manager): State<BackupManager>, Query(query): Query<LimitQuery>) -> impl IntoResponse {
    Json(manager.get_logs(query.limit))
}

pub async fn get_history(State(manager): State<BackupManager>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).min(1000) as i64;
    match manager.history(limit).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => {
            error!("Failed to load backup history: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
