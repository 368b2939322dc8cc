//! # Metadata Repositories
//!
//! Centralized persistence layer over SQLite via sqlx.
//!
//! Each aggregate has a `*Repository` struct holding the shared pool and
//! exposing typed CRUD plus aggregate-specific queries. IDs are UUIDv4
//! stored as TEXT; timestamps are RFC3339 UTC TEXT so lexicographic order,
//! `datetime()` arithmetic, and chrono round-trips all agree.
//!
//! Repositories wrap driver errors with operation context and never leak
//! SQL to callers; handlers translate [`DbError`] to HTTP.

pub mod api_keys;
pub mod audit;
pub mod error;
pub mod mirrors;
pub mod modules;
pub mod organizations;
pub mod providers;
pub mod rbac;
pub mod schema;
pub mod scm;
pub mod settings;
pub mod tf_mirrors;
pub mod users;

pub use error::{DbError, Result};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::constants::DB_POOL_SIZE;

/// Shared handle to the metadata store.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the configured database and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(DB_POOL_SIZE)
            .connect(url)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply schema statements and seed rows. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.seed().await
    }

    /// Seed the synthetic default organization, the system role templates,
    /// and the system-settings singleton.
    async fn seed(&self) -> Result<()> {
        let now = fmt_ts(Utc::now());
        sqlx::query(
            "INSERT INTO organizations (id, name, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(crate::constants::DEFAULT_ORGANIZATION)
        .bind("Default")
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let system_roles: [(&str, &str, &str); 3] = [
            ("admin", "Administrator", r#"["admin"]"#),
            (
                "publisher",
                "Publisher",
                r#"["modules:write","providers:write","mirrors:read"]"#,
            ),
            (
                "viewer",
                "Viewer",
                r#"["modules:read","providers:read","mirrors:read"]"#,
            ),
        ];
        for (name, display, scopes) in system_roles {
            sqlx::query(
                "INSERT INTO role_templates (id, name, display_name, scopes, is_system, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 1, ?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .bind(display)
            .bind(scopes)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            "INSERT INTO system_settings (id, updated_at) VALUES (1, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn users(&self) -> users::UserRepository {
        users::UserRepository::new(self.pool.clone())
    }

    pub fn organizations(&self) -> organizations::OrganizationRepository {
        organizations::OrganizationRepository::new(self.pool.clone())
    }

    pub fn rbac(&self) -> rbac::RbacRepository {
        rbac::RbacRepository::new(self.pool.clone())
    }

    pub fn api_keys(&self) -> api_keys::ApiKeyRepository {
        api_keys::ApiKeyRepository::new(self.pool.clone())
    }

    pub fn providers(&self) -> providers::ProviderRepository {
        providers::ProviderRepository::new(self.pool.clone())
    }

    pub fn modules(&self) -> modules::ModuleRepository {
        modules::ModuleRepository::new(self.pool.clone())
    }

    pub fn mirrors(&self) -> mirrors::MirrorRepository {
        mirrors::MirrorRepository::new(self.pool.clone())
    }

    pub fn tf_mirrors(&self) -> tf_mirrors::TerraformMirrorRepository {
        tf_mirrors::TerraformMirrorRepository::new(self.pool.clone())
    }

    pub fn scm(&self) -> scm::ScmRepository {
        scm::ScmRepository::new(self.pool.clone())
    }

    pub fn settings(&self) -> settings::SettingsRepository {
        settings::SettingsRepository::new(self.pool.clone())
    }

    pub fn audit(&self) -> audit::AuditRepository {
        audit::AuditRepository::new(self.pool.clone())
    }
}

/// Canonical timestamp encoding for the schema.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::Internal(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| DbError::Internal(format!("bad uuid {raw:?}: {e}")))
}

pub(crate) fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_uuid).transpose()
}

/// Decode a JSON array column into a string list, tolerating NULL.
pub(crate) fn parse_string_list(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        None => Ok(Vec::new()),
        Some(s) if s.is_empty() => Ok(Vec::new()),
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| DbError::Internal(format!("bad json list {s:?}: {e}"))),
    }
}

pub(crate) fn encode_string_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
        let org = db
            .organizations()
            .get_by_name(crate::constants::DEFAULT_ORGANIZATION)
            .await
            .unwrap();
        assert!(org.is_some());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        assert!((now - parsed).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = fmt_ts("2024-01-02T03:04:05Z".parse().unwrap());
        let late = fmt_ts("2024-01-02T03:04:06Z".parse().unwrap());
        assert!(early < late);
    }
}
