//! API keys.
//!
//! The plaintext key is never stored; rows carry a bcrypt hash plus the
//! plaintext's first characters (`key_prefix`) so authentication can narrow
//! to a few candidate rows before the constant-time hash comparison.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    encode_string_list, fmt_ts, parse_opt_ts, parse_opt_uuid, parse_string_list, parse_ts,
    parse_uuid, DbError, Result,
};

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expiry_notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    user_id: Option<String>,
    organization_id: String,
    name: String,
    key_hash: String,
    key_prefix: String,
    scopes: String,
    expires_at: Option<String>,
    last_used_at: Option<String>,
    expiry_notification_sent_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_key(row: ApiKeyRow) -> Result<ApiKey> {
    Ok(ApiKey {
        id: parse_uuid(&row.id)?,
        user_id: parse_opt_uuid(row.user_id)?,
        organization_id: parse_uuid(&row.organization_id)?,
        name: row.name,
        key_hash: row.key_hash,
        key_prefix: row.key_prefix,
        scopes: parse_string_list(Some(row.scopes))?,
        expires_at: parse_opt_ts(row.expires_at)?,
        last_used_at: parse_opt_ts(row.last_used_at)?,
        expiry_notification_sent_at: parse_opt_ts(row.expiry_notification_sent_at)?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

const KEY_COLS: &str = "id, user_id, organization_id, name, key_hash, key_prefix, scopes, \
    expires_at, last_used_at, expiry_notification_sent_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct ApiKeyRepository {
    pool: SqlitePool,
}

impl ApiKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, key), fields(name = %key.name))]
    pub async fn create_key(&self, key: &NewApiKey) -> Result<ApiKey> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO api_keys (id, user_id, organization_id, name, key_hash, key_prefix, \
             scopes, expires_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(key.user_id.map(|u| u.to_string()))
        .bind(key.organization_id.to_string())
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(encode_string_list(&key.scopes))
        .bind(key.expires_at.map(fmt_ts))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(ApiKey {
            id,
            user_id: key.user_id,
            organization_id: key.organization_id,
            name: key.name.clone(),
            key_hash: key.key_hash.clone(),
            key_prefix: key.key_prefix.clone(),
            scopes: key.scopes.clone(),
            expires_at: key.expires_at,
            last_used_at: None,
            expiry_notification_sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiKey>> {
        let row: Option<ApiKeyRow> =
            sqlx::query_as(&format!("SELECT {KEY_COLS} FROM api_keys WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_key).transpose()
    }

    /// Candidate rows for an incoming plaintext key, narrowed by prefix.
    /// The caller runs the bcrypt comparison.
    #[tracing::instrument(skip(self, prefix))]
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {KEY_COLS} FROM api_keys WHERE key_prefix = ?"
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_key).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<ApiKey>> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {KEY_COLS} FROM api_keys WHERE user_id = ? ORDER BY created_at DESC"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_key).collect()
    }

    /// Touch `last_used_at` only; the hash is never rewritten here.
    #[tracing::instrument(skip(self))]
    pub async fn update_last_used(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace hash and prefix during rotation; scopes and expiry survive.
    #[tracing::instrument(skip(self, key_hash, key_prefix))]
    pub async fn rotate(&self, id: Uuid, key_hash: &str, key_prefix: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET key_hash = ?, key_prefix = ?, updated_at = ? WHERE id = ?",
        )
        .bind(key_hash)
        .bind(key_prefix)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("api key not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("api key not found".to_string()));
        }
        Ok(())
    }

    /// Keys expiring within the warning window that have not been notified.
    #[tracing::instrument(skip(self))]
    pub async fn list_expiring(&self, within: chrono::Duration) -> Result<Vec<ApiKey>> {
        let cutoff = fmt_ts(Utc::now() + within);
        let now = fmt_ts(Utc::now());
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {KEY_COLS} FROM api_keys
             WHERE expires_at IS NOT NULL AND expires_at > ? AND expires_at <= ?
               AND expiry_notification_sent_at IS NULL"
        ))
        .bind(&now)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_key).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_expiry_notified(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET expiry_notification_sent_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn seed_key(db: &Database, prefix: &str, expires_in_days: Option<i64>) -> ApiKey {
        let org = db.organizations().default_org().await.unwrap();
        db.api_keys()
            .create_key(&NewApiKey {
                user_id: None,
                organization_id: org.id,
                name: "ci".to_string(),
                key_hash: "$2b$12$fakehash".to_string(),
                key_prefix: prefix.to_string(),
                scopes: vec!["modules:write".to_string()],
                expires_at: expires_in_days.map(|d| Utc::now() + chrono::Duration::days(d)),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_prefix_lookup_and_last_used() {
        let db = Database::in_memory().await.unwrap();
        let key = seed_key(&db, "tfr_abcd1234", None).await;

        let candidates = db.api_keys().find_by_prefix("tfr_abcd1234").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].last_used_at.is_none());

        db.api_keys().update_last_used(key.id).await.unwrap();
        let after = db.api_keys().get_by_id(key.id).await.unwrap().unwrap();
        assert!(after.last_used_at.is_some());
        // The hash never changes on use.
        assert_eq!(after.key_hash, key.key_hash);
    }

    #[tokio::test]
    async fn test_expiry_scan_window() {
        let db = Database::in_memory().await.unwrap();
        let soon = seed_key(&db, "tfr_soon", Some(3)).await;
        let _far = seed_key(&db, "tfr_far", Some(60)).await;
        let _none = seed_key(&db, "tfr_none", None).await;

        let expiring = db
            .api_keys()
            .list_expiring(chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);

        db.api_keys().mark_expiry_notified(soon.id).await.unwrap();
        let again = db
            .api_keys()
            .list_expiring(chrono::Duration::days(7))
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
