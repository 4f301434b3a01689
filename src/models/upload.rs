//! Request and response shapes of the upload API.

use crate::models::{
    object::{AccessPolicy, ObjectStatus},
    part::PartETag,
    session::UploadStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client override of the single/multipart decision.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartHint {
    pub enabled: Option<bool>,
    pub part_size: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub tenant_id: String,
    pub declared_size: i64,
    pub mime_type: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub access_policy: Option<AccessPolicy>,
    #[serde(default)]
    pub multipart_hint: Option<MultipartHint>,
}

/// A signed URL the client may PUT one chunk (or the whole object) to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartGrant {
    pub part_number: i32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// A freshly admitted upload.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub session_id: Uuid,
    pub object_id: Uuid,
    pub bucket: String,
    pub storage_key: String,
    pub multipart: bool,
    pub part_size: i64,
    pub total_parts: i32,
    pub parts: Vec<PartGrant>,
    pub session_expires_at: DateTime<Utc>,
}

/// Admission answered from an existing object; nothing needs uploading.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DedupHit {
    pub object_id: Uuid,
    pub url: String,
    pub no_upload_needed: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum InitUploadResponse {
    Upload(UploadTicket),
    Deduplicated(DedupHit),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RefreshUploadRequest {
    #[serde(default)]
    pub part_numbers: Vec<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshUploadResponse {
    pub parts: Vec<PartGrant>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    #[serde(default)]
    pub parts: Option<Vec<PartETag>>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub object_id: Uuid,
    pub status: UploadStatus,
}

/// Read-only projection of a session and its object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusView {
    pub session_id: Uuid,
    pub object_id: Uuid,
    pub upload_status: UploadStatus,
    pub object_status: ObjectStatus,
    pub finished: bool,
    pub completed_parts: i32,
    pub total_parts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_expires_at: Option<DateTime<Utc>>,
}
