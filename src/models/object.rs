//! Represents an object (file) admitted for ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of the object an upload session produces.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    Init,
    Processing,
    Completed,
    Failed,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Who may read the object once it is stored.
///
/// Public objects get a permanent unsigned URL; private ones only ever get
/// time-limited signed URLs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessPolicy {
    Public,
    #[default]
    Private,
}

impl AccessPolicy {
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }

    /// Directory segment used in storage keys.
    pub fn key_segment(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// Where an object's bytes live on the backend. Assigned once at admission.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata row for an ingested object. The bytes themselves live on the
/// storage backend at `bucket`/`storage_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    pub id: Uuid,

    pub tenant_id: String,

    /// Original filename, if the client declared one.
    pub filename: Option<String>,

    /// Size declared at admission, in bytes.
    pub size_bytes: i64,

    pub mime_type: String,

    /// Lower-case hex SHA-256 of the content. Optional at admission, required
    /// before a chunked upload may be finalized.
    pub content_hash: Option<String>,

    pub bucket: String,

    pub storage_key: String,

    pub access_policy: AccessPolicy,

    pub status: ObjectStatus,

    /// Entity tag reported by the backend once the object is assembled.
    pub etag: Option<String>,

    /// Soft-delete marker set by an explicit user delete.
    pub deleted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Size and digest the bytes of an upload have to arrive with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedContent {
    pub size_bytes: i64,
    /// Lower-case hex SHA-256, when the client declared one.
    pub sha256: Option<String>,
}

impl ObjectRecord {
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.storage_key)
    }

    pub fn expected_content(&self) -> ExpectedContent {
        ExpectedContent {
            size_bytes: self.size_bytes,
            sha256: self.content_hash.clone(),
        }
    }
}
