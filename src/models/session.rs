//! Represents an upload session: one bounded-lifetime attempt to ingest the
//! bytes of one object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// `Init`/`InProgress` are live, `Processing` is non-terminal but only the
/// finalizer (or an abort) may move it on, everything else is terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Init,
    InProgress,
    Processing,
    Completed,
    Aborted,
    Expired,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::InProgress => "IN_PROGRESS",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        }
    }

    /// Statuses that still accept grants, refreshes and completion.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Init | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted | Self::Expired | Self::Failed
        )
    }
}

/// A single upload session row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Session id handed to the client.
    pub id: Uuid,

    /// Tenant the upload is charged to.
    pub tenant_id: String,

    /// The object this session produces (exactly one per session).
    pub object_id: Uuid,

    /// Whether bytes arrive as independently uploaded chunks.
    pub multipart: bool,

    /// Chunk size in bytes. Equals the declared size for single-part uploads.
    pub part_size: i64,

    /// Number of chunks, fixed at admission.
    pub total_parts: i32,

    /// Chunks the backend has reported as received. Never exceeds `total_parts`.
    pub completed_parts: i32,

    /// Backend-side multipart id. `None` for single-part sessions.
    pub backend_token: Option<String>,

    pub status: UploadStatus,

    /// Absolute expiry; nothing is accepted for the session after this instant.
    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    /// Last transition time; doubles as "terminal since" for purging.
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Number of parts a declared size splits into.
pub fn total_parts_for(declared_size: i64, part_size: i64) -> i64 {
    if declared_size <= 0 || part_size <= 0 {
        return 0;
    }
    (declared_size + part_size - 1) / part_size
}
