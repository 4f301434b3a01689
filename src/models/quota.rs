//! Represents a tenant's storage quota account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-tenant storage accounting.
///
/// `bytes_reserved`/`objects_reserved` hold budget claimed by admitted but
/// not yet completed uploads; they count against the limits like used bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct QuotaAccount {
    pub tenant_id: String,
    pub bytes_used: i64,
    pub objects_count: i64,
    pub bytes_reserved: i64,
    pub objects_reserved: i64,
    pub max_bytes: i64,
    pub max_objects: i64,
    pub updated_at: DateTime<Utc>,
}

/// Read-only usage projection returned to operators.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub tenant_id: String,
    pub bytes_used: i64,
    pub bytes_reserved: i64,
    pub bytes_limit: i64,
    pub bytes_usage_percent: f64,
    pub objects_used: i64,
    pub objects_reserved: i64,
    pub objects_limit: i64,
    pub objects_usage_percent: f64,
}

impl QuotaAccount {
    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            tenant_id: self.tenant_id.clone(),
            bytes_used: self.bytes_used,
            bytes_reserved: self.bytes_reserved,
            bytes_limit: self.max_bytes,
            bytes_usage_percent: percent(self.bytes_used, self.max_bytes),
            objects_used: self.objects_count,
            objects_reserved: self.objects_reserved,
            objects_limit: self.max_objects,
            objects_usage_percent: percent(self.objects_count, self.max_objects),
        }
    }
}

/// Percentage rounded to two decimals; a zero limit reads as fully used.
fn percent(used: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 100.0;
    }
    let raw = used as f64 / limit as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}
