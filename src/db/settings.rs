//! System settings singleton, storage configurations, and OIDC
//! configurations.
//!
//! Storage and OIDC configs share the single-active invariant: activation
//! runs in one transaction that clears every `is_active` flag before setting
//! the target row, so readers observe exactly one active config.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_ts, parse_uuid, DbError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemSettings {
    pub storage_configured: bool,
    pub storage_configured_at: Option<DateTime<Utc>>,
    pub storage_configured_by: Option<String>,
    pub setup_completed: bool,
    #[serde(skip_serializing)]
    pub setup_token_hash: Option<String>,
    pub oidc_configured: bool,
    pub pending_admin_email: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageConfig {
    pub id: Uuid,
    pub backend_type: String,
    pub is_active: bool,
    /// JSON settings blob; sensitive values inside are sealed by the token
    /// cipher before this row is written.
    #[serde(skip_serializing)]
    pub settings: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OidcConfig {
    pub id: Uuid,
    pub name: String,
    pub provider_type: String,
    pub issuer_url: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_encrypted: Option<String>,
    pub redirect_url: Option<String>,
    pub scopes: String,
    pub is_active: bool,
    pub extra_config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type StorageRow = (String, String, i64, String, String, String);

fn row_to_storage(row: StorageRow) -> Result<StorageConfig> {
    Ok(StorageConfig {
        id: parse_uuid(&row.0)?,
        backend_type: row.1,
        is_active: row.2 != 0,
        settings: row.3,
        created_at: parse_ts(&row.4)?,
        updated_at: parse_ts(&row.5)?,
    })
}

#[derive(sqlx::FromRow)]
struct OidcRow {
    id: String,
    name: String,
    provider_type: String,
    issuer_url: String,
    client_id: String,
    client_secret_encrypted: Option<String>,
    redirect_url: Option<String>,
    scopes: String,
    is_active: i64,
    extra_config: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_oidc(row: OidcRow) -> Result<OidcConfig> {
    Ok(OidcConfig {
        id: parse_uuid(&row.id)?,
        name: row.name,
        provider_type: row.provider_type,
        issuer_url: row.issuer_url,
        client_id: row.client_id,
        client_secret_encrypted: row.client_secret_encrypted,
        redirect_url: row.redirect_url,
        scopes: row.scopes,
        is_active: row.is_active != 0,
        extra_config: row.extra_config,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

const STORAGE_COLS: &str = "id, backend_type, is_active, settings, created_at, updated_at";
const OIDC_COLS: &str = "id, name, provider_type, issuer_url, client_id, \
    client_secret_encrypted, redirect_url, scopes, is_active, extra_config, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_system_settings(&self) -> Result<SystemSettings> {
        let row: (
            i64,
            Option<String>,
            Option<String>,
            i64,
            Option<String>,
            i64,
            Option<String>,
        ) = sqlx::query_as(
            "SELECT storage_configured, storage_configured_at, storage_configured_by, \
             setup_completed, setup_token_hash, oidc_configured, pending_admin_email
             FROM system_settings WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(SystemSettings {
            storage_configured: row.0 != 0,
            storage_configured_at: parse_opt_ts(row.1)?,
            storage_configured_by: row.2,
            setup_completed: row.3 != 0,
            setup_token_hash: row.4,
            oidc_configured: row.5 != 0,
            pending_admin_email: row.6,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_storage_configured(&self, by: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE system_settings SET storage_configured = 1, storage_configured_at = ?, \
             storage_configured_by = ?, updated_at = ? WHERE id = 1",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(by)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_setup_completed(&self) -> Result<()> {
        sqlx::query("UPDATE system_settings SET setup_completed = 1, updated_at = ? WHERE id = 1")
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_oidc_configured(&self) -> Result<()> {
        sqlx::query("UPDATE system_settings SET oidc_configured = 1, updated_at = ? WHERE id = 1")
            .bind(fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, settings))]
    pub async fn create_storage_config(
        &self,
        backend_type: &str,
        settings: &str,
    ) -> Result<StorageConfig> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO storage_configs (id, backend_type, is_active, settings, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(backend_type)
        .bind(settings)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(StorageConfig {
            id,
            backend_type: backend_type.to_string(),
            is_active: false,
            settings: settings.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_storage_config(&self, id: Uuid) -> Result<Option<StorageConfig>> {
        let row: Option<StorageRow> = sqlx::query_as(&format!(
            "SELECT {STORAGE_COLS} FROM storage_configs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_storage).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_active_storage_config(&self) -> Result<Option<StorageConfig>> {
        let row: Option<StorageRow> = sqlx::query_as(&format!(
            "SELECT {STORAGE_COLS} FROM storage_configs WHERE is_active = 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_storage).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_storage_configs(&self) -> Result<Vec<StorageConfig>> {
        let rows: Vec<StorageRow> = sqlx::query_as(&format!(
            "SELECT {STORAGE_COLS} FROM storage_configs ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_storage).collect()
    }

    /// Single-flight activation: clear all flags, set the target, commit.
    #[tracing::instrument(skip(self))]
    pub async fn activate_storage_config(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE storage_configs SET is_active = 0")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE storage_configs SET is_active = 1, updated_at = ? WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(DbError::NotFound("storage config not found".to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_storage_config(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM storage_configs WHERE id = ? AND is_active = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.get_storage_config(id).await? {
                Some(_) => Err(DbError::Conflict(
                    "active storage config cannot be deleted".to_string(),
                )),
                None => Err(DbError::NotFound("storage config not found".to_string())),
            };
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, client_secret_encrypted))]
    pub async fn create_oidc_config(
        &self,
        name: &str,
        provider_type: &str,
        issuer_url: &str,
        client_id: &str,
        client_secret_encrypted: Option<&str>,
        redirect_url: Option<&str>,
        scopes: &str,
        extra_config: Option<&str>,
    ) -> Result<OidcConfig> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO oidc_configs (id, name, provider_type, issuer_url, client_id, \
             client_secret_encrypted, redirect_url, scopes, is_active, extra_config, created_at, \
             updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(provider_type)
        .bind(issuer_url)
        .bind(client_id)
        .bind(client_secret_encrypted)
        .bind(redirect_url)
        .bind(scopes)
        .bind(extra_config)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        self.get_oidc_config(id)
            .await?
            .ok_or_else(|| DbError::Internal("oidc config vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_oidc_config(&self, id: Uuid) -> Result<Option<OidcConfig>> {
        let row: Option<OidcRow> = sqlx::query_as(&format!(
            "SELECT {OIDC_COLS} FROM oidc_configs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_oidc).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_active_oidc_config(&self) -> Result<Option<OidcConfig>> {
        let row: Option<OidcRow> = sqlx::query_as(&format!(
            "SELECT {OIDC_COLS} FROM oidc_configs WHERE is_active = 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_oidc).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_oidc_configs(&self) -> Result<Vec<OidcConfig>> {
        let rows: Vec<OidcRow> = sqlx::query_as(&format!(
            "SELECT {OIDC_COLS} FROM oidc_configs ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_oidc).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn activate_oidc_config(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE oidc_configs SET is_active = 0")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE oidc_configs SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(DbError::NotFound("oidc config not found".to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_oidc_config(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM oidc_configs WHERE id = ? AND is_active = 0")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.get_oidc_config(id).await? {
                Some(_) => Err(DbError::Conflict(
                    "active oidc config cannot be deleted".to_string(),
                )),
                None => Err(DbError::NotFound("oidc config not found".to_string())),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_activate_storage_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.settings();
        let a = repo.create_storage_config("local", "{}").await.unwrap();
        let b = repo.create_storage_config("s3", "{}").await.unwrap();

        repo.activate_storage_config(a.id).await.unwrap();
        repo.activate_storage_config(b.id).await.unwrap();

        let active = repo.get_active_storage_config().await.unwrap().unwrap();
        assert_eq!(active.id, b.id);
        let all = repo.list_storage_configs().await.unwrap();
        assert_eq!(all.iter().filter(|c| c.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_activate_missing_rolls_back() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.settings();
        let a = repo.create_storage_config("local", "{}").await.unwrap();
        repo.activate_storage_config(a.id).await.unwrap();

        let err = repo.activate_storage_config(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        // The rollback preserved the previous active row.
        let active = repo.get_active_storage_config().await.unwrap().unwrap();
        assert_eq!(active.id, a.id);
    }

    #[tokio::test]
    async fn test_active_config_delete_refused() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.settings();
        let a = repo.create_storage_config("local", "{}").await.unwrap();
        repo.activate_storage_config(a.id).await.unwrap();
        assert!(matches!(
            repo.delete_storage_config(a.id).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_system_settings_flags() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.settings();
        let before = repo.get_system_settings().await.unwrap();
        assert!(!before.storage_configured);
        repo.mark_storage_configured(Some("admin@example.com")).await.unwrap();
        repo.mark_setup_completed().await.unwrap();
        let after = repo.get_system_settings().await.unwrap();
        assert!(after.storage_configured);
        assert!(after.setup_completed);
    }
}
