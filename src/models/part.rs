//! Represents a part reported by the client when completing a chunked upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single part of a chunked upload, persisted when completion is requested.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PartRecord {
    /// Reference to the parent upload session.
    pub session_id: Uuid,

    /// Part number (1-based).
    pub part_number: i32,

    /// ETag the backend returned for this part.
    pub etag: String,

    pub uploaded_at: DateTime<Utc>,
}

/// Part number / entity tag pair as supplied by a client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartETag {
    pub part_number: i32,
    pub etag: String,
}

impl PartETag {
    pub fn new(part_number: i32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

impl From<PartRecord> for PartETag {
    fn from(record: PartRecord) -> Self {
        Self {
            part_number: record.part_number,
            etag: record.etag,
        }
    }
}
