//! HTTP handlers. Every handler receives the shared [`AppState`].

use crate::services::{local_gateway::LocalStorageGateway, upload_service::UploadSessionManager};
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod blob_handlers;
pub mod health_handlers;
pub mod quota_handlers;
pub mod upload_handlers;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<UploadSessionManager>,
    /// Disk backend serving the grant-authenticated blob endpoint.
    pub blobs: Arc<LocalStorageGateway>,
    pub db: Arc<SqlitePool>,
}
