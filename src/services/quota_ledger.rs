//! src/services/quota_ledger.rs
//!
//! Per-tenant byte and object budgets. Admission reserves, a finished upload
//! converts its reservation into usage, and every other end of a session
//! releases it. Commit and release run on the caller's connection so they
//! take effect only together with the session transition that triggers them.

use crate::models::quota::{QuotaAccount, QuotaUsage};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use thiserror::Error;

const WARN_PERCENT: f64 = 80.0;
const ERROR_PERCENT: f64 = 90.0;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota exceeded for tenant `{tenant_id}`: {reason}")]
    Exceeded { tenant_id: String, reason: String },
    #[error("invalid quota limits: {0}")]
    InvalidLimits(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct QuotaLedger {
    db: Arc<SqlitePool>,
    default_max_bytes: i64,
    default_max_objects: i64,
}

impl QuotaLedger {
    pub fn new(db: Arc<SqlitePool>, default_max_bytes: i64, default_max_objects: i64) -> Self {
        Self {
            db,
            default_max_bytes,
            default_max_objects,
        }
    }

    /// Create the tenant's account with default limits if it does not exist.
    async fn ensure_account(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO quota_accounts (
                tenant_id, bytes_used, objects_count, bytes_reserved, objects_reserved,
                max_bytes, max_objects, updated_at
             ) VALUES (?, 0, 0, 0, 0, ?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(self.default_max_bytes)
        .bind(self.default_max_objects)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn fetch(
        conn: &mut SqliteConnection,
        tenant_id: &str,
    ) -> Result<QuotaAccount, sqlx::Error> {
        sqlx::query_as::<_, QuotaAccount>(
            "SELECT tenant_id, bytes_used, objects_count, bytes_reserved, objects_reserved,
                    max_bytes, max_objects, updated_at
             FROM quota_accounts WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_one(&mut *conn)
        .await
    }

    /// Claim `bytes` and one object slot for `tenant_id`.
    ///
    /// The check and the increment are a single conditional update, so two
    /// concurrent reservations can never both pass on the same headroom.
    pub async fn reserve(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: &str,
        bytes: i64,
    ) -> Result<(), QuotaError> {
        self.ensure_account(conn, tenant_id).await?;

        let result = sqlx::query(
            "UPDATE quota_accounts
             SET bytes_reserved = bytes_reserved + ?,
                 objects_reserved = objects_reserved + 1,
                 updated_at = ?
             WHERE tenant_id = ?
               AND bytes_used + bytes_reserved + ? <= max_bytes
               AND objects_count + objects_reserved + 1 <= max_objects",
        )
        .bind(bytes)
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(bytes)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let account = Self::fetch(conn, tenant_id).await?;
        let reason = if account.objects_count + account.objects_reserved + 1 > account.max_objects
        {
            format!("object limit of {} reached", account.max_objects)
        } else {
            format!(
                "{} bytes requested, {} of {} bytes already used or reserved",
                bytes,
                account.bytes_used + account.bytes_reserved,
                account.max_bytes
            )
        };
        tracing::info!(tenant_id, bytes, "quota reservation refused: {}", reason);
        Err(QuotaError::Exceeded {
            tenant_id: tenant_id.to_string(),
            reason,
        })
    }

    /// Turn a reservation into usage.
    pub async fn commit(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: &str,
        bytes: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE quota_accounts
             SET bytes_reserved = MAX(bytes_reserved - ?, 0),
                 objects_reserved = MAX(objects_reserved - 1, 0),
                 bytes_used = bytes_used + ?,
                 objects_count = objects_count + 1,
                 updated_at = ?
             WHERE tenant_id = ?",
        )
        .bind(bytes)
        .bind(bytes)
        .bind(Utc::now())
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;

        let account = Self::fetch(conn, tenant_id).await?;
        warn_on_pressure(&account.usage());
        Ok(())
    }

    /// Give a reservation back without recording usage.
    pub async fn release(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: &str,
        bytes: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE quota_accounts
             SET bytes_reserved = MAX(bytes_reserved - ?, 0),
                 objects_reserved = MAX(objects_reserved - 1, 0),
                 updated_at = ?
             WHERE tenant_id = ?",
        )
        .bind(bytes)
        .bind(Utc::now())
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Return usage freed by deleting a stored object.
    pub async fn reclaim(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: &str,
        bytes: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE quota_accounts
             SET bytes_used = MAX(bytes_used - ?, 0),
                 objects_count = MAX(objects_count - 1, 0),
                 updated_at = ?
             WHERE tenant_id = ?",
        )
        .bind(bytes)
        .bind(Utc::now())
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn usage(&self, tenant_id: &str) -> Result<QuotaUsage, sqlx::Error> {
        let mut conn = self.db.acquire().await?;
        self.ensure_account(&mut conn, tenant_id).await?;
        Ok(Self::fetch(&mut conn, tenant_id).await?.usage())
    }

    /// Replace the tenant's limits. Lowering a limit below current usage is
    /// allowed; it only blocks further reservations.
    pub async fn set_limits(
        &self,
        tenant_id: &str,
        max_bytes: i64,
        max_objects: i64,
    ) -> Result<QuotaUsage, QuotaError> {
        if max_bytes <= 0 || max_objects <= 0 {
            return Err(QuotaError::InvalidLimits(format!(
                "limits must be positive, got {} bytes and {} objects",
                max_bytes, max_objects
            )));
        }

        let mut tx = self.db.begin().await?;
        self.ensure_account(&mut tx, tenant_id).await?;
        sqlx::query(
            "UPDATE quota_accounts SET max_bytes = ?, max_objects = ?, updated_at = ?
             WHERE tenant_id = ?",
        )
        .bind(max_bytes)
        .bind(max_objects)
        .bind(Utc::now())
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
        let account = Self::fetch(&mut tx, tenant_id).await?;
        tx.commit().await?;

        tracing::info!(tenant_id, max_bytes, max_objects, "quota limits updated");
        Ok(account.usage())
    }
}

fn warn_on_pressure(usage: &QuotaUsage) {
    let worst = usage.bytes_usage_percent.max(usage.objects_usage_percent);
    if worst >= ERROR_PERCENT {
        tracing::error!(
            tenant_id = %usage.tenant_id,
            bytes_percent = usage.bytes_usage_percent,
            objects_percent = usage.objects_usage_percent,
            "tenant quota above {}%",
            ERROR_PERCENT
        );
    } else if worst >= WARN_PERCENT {
        tracing::warn!(
            tenant_id = %usage.tenant_id,
            bytes_percent = usage.bytes_usage_percent,
            objects_percent = usage.objects_usage_percent,
            "tenant quota above {}%",
            WARN_PERCENT
        );
    }
}
