//! Grant-authenticated byte endpoint backing `LocalStorageGateway`.
//! Bodies are streamed to and from disk without buffering. Writes are only
//! accepted while the owning upload session is live.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::object::ObjectLocation,
    services::local_gateway::{GrantParams, LocalStorageGateway},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query string of a blob request. Public reads carry none of it.
#[derive(Debug, Default, Deserialize)]
pub struct BlobQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<i32>,
    pub size: Option<i64>,
    pub sha256: Option<String>,
}

impl BlobQuery {
    fn into_grant(self) -> Result<GrantParams, AppError> {
        match (self.expires, self.signature) {
            (Some(expires), Some(signature)) => Ok(GrantParams {
                expires,
                signature,
                upload_id: self.upload_id,
                part_number: self.part_number,
                size: self.size,
                sha256: self.sha256,
            }),
            _ => Err(AppError::forbidden("missing grant signature")),
        }
    }
}

/// `PUT /blobs/{bucket}/{*key}`: store a whole object, or one chunk when
/// the grant names an upload and part number.
pub async fn put_blob(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
    body: Body,
) -> Result<Response, AppError> {
    let location = ObjectLocation::new(bucket, key);
    let grant = query.into_grant()?;
    state.blobs.verify_grant("PUT", &location, &grant)?;
    let session = state.manager.writable_session(&location).await?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let etag = match (grant.upload_id.as_deref(), grant.part_number) {
        (Some(token), Some(part_number)) => {
            let (etag, staged) = state
                .blobs
                .write_part(&location, token, part_number, stream)
                .await?;
            state
                .manager
                .note_part_received(token, i32::try_from(staged).unwrap_or(i32::MAX))
                .await?;
            tracing::debug!(%location, part_number, staged, "part stored");
            etag
        }
        _ => {
            let expected = grant
                .expected_content()
                .ok_or_else(|| AppError::forbidden("grant does not bind a content size"))?;
            let etag = state
                .blobs
                .write_object(&location, &expected, stream)
                .await?;
            state
                .manager
                .settle_blob_write(session.id, &location)
                .await?;
            tracing::debug!(%location, "object stored");
            etag
        }
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /blobs/{bucket}/{*key}`: stream a stored object. Public keys are
/// served unsigned; everything else needs a GET grant.
pub async fn get_blob(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
) -> Result<Response, AppError> {
    let location = ObjectLocation::new(bucket, key);
    if !LocalStorageGateway::is_public_key(&location) {
        let grant = query.into_grant()?;
        state.blobs.verify_grant("GET", &location, &grant)?;
    }

    let file = state.blobs.open_object(&location).await?;
    let len = file.metadata().await.ok().map(|meta| meta.len());
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(response)
}
