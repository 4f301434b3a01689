//! Operator endpoints for tenant quotas.

use crate::{
    errors::AppError, handlers::AppState, models::quota::QuotaUsage,
    services::upload_service::UploadError,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;

/// Body of `PUT /quotas/{tenant}`. Omitted limits keep their current value.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuotaRequest {
    pub max_bytes: Option<i64>,
    pub max_objects: Option<i64>,
}

/// `GET /quotas/{tenant}`
pub async fn get_quota(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<QuotaUsage>, AppError> {
    let usage = state
        .manager
        .quota()
        .usage(&tenant_id)
        .await
        .map_err(UploadError::from)?;
    Ok(Json(usage))
}

/// `PUT /quotas/{tenant}`
pub async fn set_quota(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<SetQuotaRequest>,
) -> Result<Json<QuotaUsage>, AppError> {
    let ledger = state.manager.quota();
    let current = ledger.usage(&tenant_id).await.map_err(UploadError::from)?;
    let usage = ledger
        .set_limits(
            &tenant_id,
            req.max_bytes.unwrap_or(current.bytes_limit),
            req.max_objects.unwrap_or(current.objects_limit),
        )
        .await
        .map_err(UploadError::from)?;
    Ok(Json(usage))
}
