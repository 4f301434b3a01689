//! JSON endpoints for the upload session lifecycle and explicit deletes.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::upload::{
        CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
        RefreshUploadRequest, RefreshUploadResponse, UploadStatusView,
    },
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

/// `POST /uploads`: 201 with grants, or 200 when answered by dedup.
pub async fn init_upload(
    State(state): State<AppState>,
    Json(req): Json<InitUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.manager.init_upload(req).await?;
    let status = match response {
        InitUploadResponse::Upload(_) => StatusCode::CREATED,
        InitUploadResponse::Deduplicated(_) => StatusCode::OK,
    };
    Ok((status, Json(response)))
}

/// `POST /uploads/{id}/refresh`
pub async fn refresh_upload(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<RefreshUploadRequest>,
) -> Result<Json<RefreshUploadResponse>, AppError> {
    let response = state
        .manager
        .refresh_upload(session_id, &req.part_numbers)
        .await?;
    Ok(Json(response))
}

/// `POST /uploads/{id}/complete`: 200 when completed, 202 while the merge
/// runs in the background.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<(StatusCode, Json<CompleteUploadResponse>), AppError> {
    let response = state.manager.complete_upload(session_id, req).await?;
    let status = if response.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(response)))
}

/// `GET /uploads/{id}`
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<UploadStatusView>, AppError> {
    Ok(Json(state.manager.get_status(session_id).await?))
}

/// `DELETE /uploads/{id}`
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.manager.abort_upload(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /objects/{id}`
pub async fn delete_object(
    State(state): State<AppState>,
    Path(object_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_object(object_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
