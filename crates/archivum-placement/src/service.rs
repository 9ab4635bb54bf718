//! HTTP surface of the authoritative directory
//!
//! Peer daemons configured with `directory.endpoint` reach this through
//! [`HttpDirectory`](crate::http::HttpDirectory).

use crate::directory::{CapacityDirectory, DirectorySnapshot, HeartbeatAck, Reservation};
use archivum_common::{Error, StorageMode, StorageNodeDescriptor};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error body returned by every directory route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StorageMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Result of a release call
#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// Error wrapper mapping directory errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Error::CapacityExhausted { .. } => StatusCode::CONFLICT,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::DirectoryUnavailable(_) | Error::LockContention { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (mode, size) = match &self.0 {
            Error::CapacityExhausted { mode, size } => (Some(*mode), Some(*size)),
            _ => (None, None),
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            mode,
            size,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes under `/v1/directory`
pub fn router(directory: Arc<dyn CapacityDirectory>) -> Router {
    Router::new()
        .route("/v1/directory/heartbeat", post(heartbeat))
        .route("/v1/directory/nodes", get(nodes))
        .route("/v1/directory/reservations", post(reserve))
        .route("/v1/directory/reservations/{id}", delete(release))
        .with_state(directory)
}

/// POST /v1/directory/heartbeat
async fn heartbeat(
    State(directory): State<Arc<dyn CapacityDirectory>>,
    Json(descriptor): Json<StorageNodeDescriptor>,
) -> ApiResult<Json<HeartbeatAck>> {
    Ok(Json(directory.heartbeat(descriptor).await?))
}

/// GET /v1/directory/nodes
async fn nodes(
    State(directory): State<Arc<dyn CapacityDirectory>>,
) -> ApiResult<Json<DirectorySnapshot>> {
    Ok(Json(directory.snapshot().await?))
}

/// POST /v1/directory/reservations
async fn reserve(
    State(directory): State<Arc<dyn CapacityDirectory>>,
    Json(reservation): Json<Reservation>,
) -> ApiResult<StatusCode> {
    directory.reserve(reservation).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/directory/reservations/{id}
async fn release(
    State(directory): State<Arc<dyn CapacityDirectory>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReleaseResponse>> {
    let released = directory.release(&id).await?;
    Ok(Json(ReleaseResponse { released }))
}
