//! Routes of the ingestion service.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /uploads`: admit an upload (or answer from dedup)
//!   - `POST   /uploads/{id}/refresh`: re-issue grants
//!   - `POST   /uploads/{id}/complete`: finish an upload
//!   - `GET    /uploads/{id}`: status projection
//!   - `DELETE /uploads/{id}`: abort
//!
//! - **Objects and quotas**
//!   - `DELETE /objects/{id}`: explicit delete of a stored object
//!   - `GET    /quotas/{tenant}`: usage and limits
//!   - `PUT    /quotas/{tenant}`: change limits
//!
//! - **Blobs** (local backend)
//!   - `PUT    /blobs/{bucket}/{*key}`: grant-authenticated upload
//!   - `GET    /blobs/{bucket}/{*key}`: download
//!
//! The wildcard `*key` allows nested keys like `acme/private/20250101/x.jpg`.

use crate::handlers::{
    AppState,
    blob_handlers::{get_blob, put_blob},
    health_handlers::{healthz, readyz},
    quota_handlers::{get_quota, set_quota},
    upload_handlers::{
        abort_upload, complete_upload, delete_object, get_upload_status, init_upload,
        refresh_upload,
    },
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(init_upload))
        .route("/uploads/{id}", get(get_upload_status).delete(abort_upload))
        .route("/uploads/{id}/refresh", post(refresh_upload))
        .route("/uploads/{id}/complete", post(complete_upload))
        .route("/objects/{id}", delete(delete_object))
        .route("/quotas/{tenant}", get(get_quota).put(set_quota))
        .route("/blobs/{bucket}/{*key}", put(put_blob).get(get_blob))
}
