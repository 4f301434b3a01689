//! src/services/events.rs
//!
//! Fire-and-forget sinks for completion notices and audit entries.
//!
//! Neither sink may fail the operation that emits into it: `publish` and
//! `record` return nothing, and implementations swallow their own errors.

use serde::Serialize;
use uuid::Uuid;

/// Terminal outcome of an upload, published once per session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    Completed {
        session_id: Uuid,
        object_id: Uuid,
        tenant_id: String,
        size_bytes: i64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        session_id: Uuid,
        object_id: Uuid,
        tenant_id: String,
        reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: UploadEvent);
}

/// Publishes events as structured log lines.
#[derive(Debug, Default, Clone)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: UploadEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "events", event = %json, "upload event"),
            Err(err) => tracing::warn!(target: "events", error = %err, "dropping unserializable event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InitUpload,
    DedupHit,
    CompleteUpload,
    AbortUpload,
    ExpireUpload,
    DeleteObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub tenant_id: String,
    pub session_id: Option<Uuid>,
    pub object_id: Uuid,
    pub detail: Option<String>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit entries on the `audit` tracing target.
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            action = ?entry.action,
            tenant_id = %entry.tenant_id,
            session_id = ?entry.session_id,
            object_id = %entry.object_id,
            detail = entry.detail.as_deref().unwrap_or(""),
            "audit"
        );
    }
}
