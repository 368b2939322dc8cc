//! Append-only audit log written by management mutations.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_uuid, parse_ts, parse_uuid, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, details))]
    pub async fn record(
        &self,
        organization_id: Option<Uuid>,
        user_id: Option<Uuid>,
        action: &str,
        resource_type: &str,
        resource_id: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, organization_id, user_id, action, resource_type, \
             resource_id, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(organization_id.map(|u| u.to_string()))
        .bind(user_id.map(|u| u.to_string()))
        .bind(action)
        .bind(resource_type)
        .bind(resource_id)
        .bind(details.map(|d| d.to_string()))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<AuditEntry>> {
        let rows: Vec<(
            String,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
        )> = sqlx::query_as(
            "SELECT id, organization_id, user_id, action, resource_type, resource_id, details, \
             created_at FROM audit_log ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(AuditEntry {
                    id: parse_uuid(&r.0)?,
                    organization_id: parse_opt_uuid(r.1)?,
                    user_id: parse_opt_uuid(r.2)?,
                    action: r.3,
                    resource_type: r.4,
                    resource_id: r.5,
                    details: r.6,
                    created_at: parse_ts(&r.7)?,
                })
            })
            .collect()
    }
}
