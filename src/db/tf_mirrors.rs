//! Terraform/OpenTofu binary mirror configurations, versions, and platforms.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_ts, parse_uuid, DbError, Result};

/// Platform filters are stored as JSON arrays of `os_arch` strings, NULL
/// meaning "all platforms". Empty inputs normalize to NULL.
pub fn parse_platform_filter(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let list: Vec<String> = serde_json::from_str(raw).ok()?;
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

/// Inverse of [`parse_platform_filter`].
pub fn encode_platform_filter(filter: Option<&[String]>) -> Option<String> {
    match filter {
        None => None,
        Some([]) => None,
        Some(list) => serde_json::to_string(list).ok(),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TerraformMirrorConfig {
    pub id: Uuid,
    pub name: String,
    pub tool: String,
    pub enabled: bool,
    pub upstream_url: Option<String>,
    pub platform_filter: Option<String>,
    pub version_filter: Option<String>,
    pub gpg_verify: bool,
    pub stable_only: bool,
    pub sync_interval_hours: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTerraformMirrorConfig {
    pub name: String,
    pub tool: String,
    pub enabled: bool,
    pub upstream_url: Option<String>,
    pub platform_filter: Option<String>,
    pub version_filter: Option<String>,
    pub gpg_verify: bool,
    pub stable_only: bool,
    pub sync_interval_hours: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TerraformVersion {
    pub id: Uuid,
    pub config_id: Uuid,
    pub version: String,
    pub is_latest: bool,
    pub is_deprecated: bool,
    pub release_date: Option<DateTime<Utc>>,
    pub sync_status: String,
    pub sync_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TerraformVersionPlatform {
    pub id: Uuid,
    pub version_id: Uuid,
    pub os: String,
    pub arch: String,
    pub upstream_url: String,
    pub filename: String,
    pub sha256: Option<String>,
    pub size_bytes: i64,
    pub storage_key: Option<String>,
    pub storage_backend: Option<String>,
    pub sha256_verified: bool,
    pub gpg_verified: bool,
    pub sync_status: String,
    pub sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: String,
    name: String,
    tool: String,
    enabled: i64,
    upstream_url: Option<String>,
    platform_filter: Option<String>,
    version_filter: Option<String>,
    gpg_verify: i64,
    stable_only: i64,
    sync_interval_hours: i64,
    last_sync_at: Option<String>,
    last_sync_status: Option<String>,
    last_sync_error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_config(row: ConfigRow) -> Result<TerraformMirrorConfig> {
    Ok(TerraformMirrorConfig {
        id: parse_uuid(&row.id)?,
        name: row.name,
        tool: row.tool,
        enabled: row.enabled != 0,
        upstream_url: row.upstream_url,
        platform_filter: row.platform_filter,
        version_filter: row.version_filter,
        gpg_verify: row.gpg_verify != 0,
        stable_only: row.stable_only != 0,
        sync_interval_hours: row.sync_interval_hours,
        last_sync_at: parse_opt_ts(row.last_sync_at)?,
        last_sync_status: row.last_sync_status,
        last_sync_error: row.last_sync_error,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: String,
    config_id: String,
    version: String,
    is_latest: i64,
    is_deprecated: i64,
    release_date: Option<String>,
    sync_status: String,
    sync_error: Option<String>,
    synced_at: Option<String>,
    created_at: String,
}

fn row_to_version(row: VersionRow) -> Result<TerraformVersion> {
    Ok(TerraformVersion {
        id: parse_uuid(&row.id)?,
        config_id: parse_uuid(&row.config_id)?,
        version: row.version,
        is_latest: row.is_latest != 0,
        is_deprecated: row.is_deprecated != 0,
        release_date: parse_opt_ts(row.release_date)?,
        sync_status: row.sync_status,
        sync_error: row.sync_error,
        synced_at: parse_opt_ts(row.synced_at)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct PlatformRow {
    id: String,
    version_id: String,
    os: String,
    arch: String,
    upstream_url: String,
    filename: String,
    sha256: Option<String>,
    size_bytes: i64,
    storage_key: Option<String>,
    storage_backend: Option<String>,
    sha256_verified: i64,
    gpg_verified: i64,
    sync_status: String,
    sync_error: Option<String>,
    created_at: String,
}

fn row_to_platform(row: PlatformRow) -> Result<TerraformVersionPlatform> {
    Ok(TerraformVersionPlatform {
        id: parse_uuid(&row.id)?,
        version_id: parse_uuid(&row.version_id)?,
        os: row.os,
        arch: row.arch,
        upstream_url: row.upstream_url,
        filename: row.filename,
        sha256: row.sha256,
        size_bytes: row.size_bytes,
        storage_key: row.storage_key,
        storage_backend: row.storage_backend,
        sha256_verified: row.sha256_verified != 0,
        gpg_verified: row.gpg_verified != 0,
        sync_status: row.sync_status,
        sync_error: row.sync_error,
        created_at: parse_ts(&row.created_at)?,
    })
}

const CONFIG_COLS: &str = "id, name, tool, enabled, upstream_url, platform_filter, \
    version_filter, gpg_verify, stable_only, sync_interval_hours, last_sync_at, \
    last_sync_status, last_sync_error, created_at, updated_at";
const VERSION_COLS: &str = "id, config_id, version, is_latest, is_deprecated, release_date, \
    sync_status, sync_error, synced_at, created_at";
const PLATFORM_COLS: &str = "id, version_id, os, arch, upstream_url, filename, sha256, \
    size_bytes, storage_key, storage_backend, sha256_verified, gpg_verified, sync_status, \
    sync_error, created_at";

#[derive(Clone, Debug)]
pub struct TerraformMirrorRepository {
    pool: SqlitePool,
}

impl TerraformMirrorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, config), fields(name = %config.name))]
    pub async fn create_config(&self, config: &NewTerraformMirrorConfig) -> Result<TerraformMirrorConfig> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO terraform_mirror_configs (id, name, tool, enabled, upstream_url, \
             platform_filter, version_filter, gpg_verify, stable_only, sync_interval_hours, \
             created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&config.name)
        .bind(&config.tool)
        .bind(config.enabled as i64)
        .bind(&config.upstream_url)
        .bind(&config.platform_filter)
        .bind(&config.version_filter)
        .bind(config.gpg_verify as i64)
        .bind(config.stable_only as i64)
        .bind(config.sync_interval_hours)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "terraform mirror with this name already exists"))?;
        self.get_config(id)
            .await?
            .ok_or_else(|| DbError::Internal("terraform mirror vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_config(&self, id: Uuid) -> Result<Option<TerraformMirrorConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM terraform_mirror_configs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_config).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_config_by_name(&self, name: &str) -> Result<Option<TerraformMirrorConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM terraform_mirror_configs WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_config).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_configs(&self) -> Result<Vec<TerraformMirrorConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM terraform_mirror_configs ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_config).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_configs_needing_sync(&self) -> Result<Vec<TerraformMirrorConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM terraform_mirror_configs
             WHERE enabled = 1
               AND (last_sync_status IS NULL OR last_sync_status != 'in_progress')
               AND (last_sync_at IS NULL
                    OR datetime(last_sync_at, '+' || sync_interval_hours || ' hours') <= datetime('now'))
             ORDER BY last_sync_at NULLS FIRST"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_config).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_sync_status(
        &self,
        id: Uuid,
        status: super::mirrors::SyncStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let stamp = match status {
            super::mirrors::SyncStatus::InProgress => None,
            _ => Some(fmt_ts(Utc::now())),
        };
        sqlx::query(
            "UPDATE terraform_mirror_configs
             SET last_sync_status = ?, last_sync_error = ?,
                 last_sync_at = COALESCE(?, last_sync_at), updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(stamp)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, config))]
    pub async fn update_config(&self, id: Uuid, config: &NewTerraformMirrorConfig) -> Result<()> {
        let result = sqlx::query(
            "UPDATE terraform_mirror_configs SET name = ?, tool = ?, enabled = ?, \
             upstream_url = ?, platform_filter = ?, version_filter = ?, gpg_verify = ?, \
             stable_only = ?, sync_interval_hours = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&config.name)
        .bind(&config.tool)
        .bind(config.enabled as i64)
        .bind(&config.upstream_url)
        .bind(&config.platform_filter)
        .bind(&config.version_filter)
        .bind(config.gpg_verify as i64)
        .bind(config.stable_only as i64)
        .bind(config.sync_interval_hours)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("terraform mirror not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_config(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM terraform_mirror_configs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("terraform mirror not found".to_string()));
        }
        Ok(())
    }

    /// Get-or-create one `(config, version)` row.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_version(
        &self,
        config_id: Uuid,
        version: &str,
        release_date: Option<DateTime<Utc>>,
    ) -> Result<TerraformVersion> {
        sqlx::query(
            "INSERT INTO terraform_versions (id, config_id, version, release_date, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(config_id, version) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(config_id.to_string())
        .bind(version)
        .bind(release_date.map(fmt_ts))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        let row: VersionRow = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM terraform_versions WHERE config_id = ? AND version = ?"
        ))
        .bind(config_id.to_string())
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        row_to_version(row)
    }

    /// Single-flight latest flip: clear the flag across the config, set it on
    /// the target, commit. At most one row per config ever has it set.
    #[tracing::instrument(skip(self))]
    pub async fn set_latest_version(&self, config_id: Uuid, version_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE terraform_versions SET is_latest = 0 WHERE config_id = ?")
            .bind(config_id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE terraform_versions SET is_latest = 1 WHERE id = ? AND config_id = ?",
        )
        .bind(version_id.to_string())
        .bind(config_id.to_string())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(DbError::NotFound("terraform version not found".to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_versions(&self, config_id: Uuid) -> Result<Vec<TerraformVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM terraform_versions WHERE config_id = ?"
        ))
        .bind(config_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut versions = rows
            .into_iter()
            .map(row_to_version)
            .collect::<Result<Vec<_>>>()?;
        crate::semver::sort_descending(&mut versions, |v| &v.version);
        Ok(versions)
    }

    /// Versions visible on the public binary-mirror endpoints.
    #[tracing::instrument(skip(self))]
    pub async fn list_synced_versions(&self, config_id: Uuid) -> Result<Vec<TerraformVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM terraform_versions
             WHERE config_id = ? AND sync_status = 'synced'"
        ))
        .bind(config_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut versions = rows
            .into_iter()
            .map(row_to_version)
            .collect::<Result<Vec<_>>>()?;
        crate::semver::sort_descending(&mut versions, |v| &v.version);
        Ok(versions)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_version(&self, config_id: Uuid, version: &str) -> Result<Option<TerraformVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM terraform_versions WHERE config_id = ? AND version = ?"
        ))
        .bind(config_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_version).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_latest_version(&self, config_id: Uuid) -> Result<Option<TerraformVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM terraform_versions
             WHERE config_id = ? AND is_latest = 1"
        ))
        .bind(config_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_version).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_version_sync_status(
        &self,
        id: Uuid,
        sync_status: &str,
        sync_error: Option<&str>,
    ) -> Result<()> {
        let synced_at = (sync_status == "synced").then(|| fmt_ts(Utc::now()));
        sqlx::query(
            "UPDATE terraform_versions SET sync_status = ?, sync_error = ?, \
             synced_at = COALESCE(?, synced_at) WHERE id = ?",
        )
        .bind(sync_status)
        .bind(sync_error)
        .bind(synced_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get-or-create one `(version, os, arch)` row; the upstream URL and
    /// expected checksum refresh on every sync pass.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self))]
    pub async fn upsert_platform(
        &self,
        version_id: Uuid,
        os: &str,
        arch: &str,
        upstream_url: &str,
        filename: &str,
        sha256: Option<&str>,
    ) -> Result<TerraformVersionPlatform> {
        sqlx::query(
            "INSERT INTO terraform_version_platforms (id, version_id, os, arch, upstream_url, \
             filename, sha256, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(version_id, os, arch) DO UPDATE SET
                 upstream_url = excluded.upstream_url,
                 filename = excluded.filename,
                 sha256 = COALESCE(excluded.sha256, terraform_version_platforms.sha256)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(version_id.to_string())
        .bind(os)
        .bind(arch)
        .bind(upstream_url)
        .bind(filename)
        .bind(sha256)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        let row: PlatformRow = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLS} FROM terraform_version_platforms
             WHERE version_id = ? AND os = ? AND arch = ?"
        ))
        .bind(version_id.to_string())
        .bind(os)
        .bind(arch)
        .fetch_one(&self.pool)
        .await?;
        row_to_platform(row)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_platforms(&self, version_id: Uuid) -> Result<Vec<TerraformVersionPlatform>> {
        let rows: Vec<PlatformRow> = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLS} FROM terraform_version_platforms
             WHERE version_id = ? ORDER BY os, arch"
        ))
        .bind(version_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_platform).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_platform(
        &self,
        version_id: Uuid,
        os: &str,
        arch: &str,
    ) -> Result<Option<TerraformVersionPlatform>> {
        let row: Option<PlatformRow> = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLS} FROM terraform_version_platforms
             WHERE version_id = ? AND os = ? AND arch = ?"
        ))
        .bind(version_id.to_string())
        .bind(os)
        .bind(arch)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_platform).transpose()
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self))]
    pub async fn update_platform_sync_status(
        &self,
        id: Uuid,
        sync_status: &str,
        storage_key: Option<&str>,
        storage_backend: Option<&str>,
        size_bytes: i64,
        sha256_verified: bool,
        gpg_verified: bool,
        sync_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE terraform_version_platforms SET sync_status = ?, storage_key = ?, \
             storage_backend = ?, size_bytes = ?, sha256_verified = ?, gpg_verified = ?, \
             sync_error = ? WHERE id = ?",
        )
        .bind(sync_status)
        .bind(storage_key)
        .bind(storage_backend)
        .bind(size_bytes)
        .bind(sha256_verified as i64)
        .bind(gpg_verified as i64)
        .bind(sync_error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_sync_history(&self, config_id: Uuid, triggered_by: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO terraform_sync_history (id, config_id, triggered_by, started_at, status)
             VALUES (?, ?, ?, ?, 'running')",
        )
        .bind(id.to_string())
        .bind(config_id.to_string())
        .bind(triggered_by)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, sync_details))]
    pub async fn complete_sync_history(
        &self,
        id: Uuid,
        status: &str,
        versions_synced: i64,
        platforms_synced: i64,
        platforms_failed: i64,
        error_message: Option<&str>,
        sync_details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE terraform_sync_history SET completed_at = ?, status = ?, versions_synced = ?, \
             platforms_synced = ?, platforms_failed = ?, error_message = ?, sync_details = ?
             WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(status)
        .bind(versions_synced)
        .bind(platforms_synced)
        .bind(platforms_failed)
        .bind(error_message)
        .bind(sync_details)
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

    fn config(name: &str) -> NewTerraformMirrorConfig {
        NewTerraformMirrorConfig {
            name: name.to_string(),
            tool: "terraform".to_string(),
            enabled: true,
            upstream_url: None,
            platform_filter: encode_platform_filter(Some(&["linux_amd64".to_string()])),
            version_filter: None,
            gpg_verify: false,
            stable_only: true,
            sync_interval_hours: 24,
        }
    }

    #[test]
    fn test_platform_filter_roundtrip() {
        let filter = vec!["linux_amd64".to_string(), "darwin_arm64".to_string()];
        let encoded = encode_platform_filter(Some(&filter)).unwrap();
        assert_eq!(parse_platform_filter(Some(&encoded)), Some(filter));

        assert_eq!(encode_platform_filter(None), None);
        assert_eq!(encode_platform_filter(Some(&[])), None);
        assert_eq!(parse_platform_filter(None), None);
        assert_eq!(parse_platform_filter(Some("")), None);
        assert_eq!(parse_platform_filter(Some("[]")), None);
    }

    #[tokio::test]
    async fn test_set_latest_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tf_mirrors();
        let cfg = repo.create_config(&config("tf")).await.unwrap();
        let v1 = repo.upsert_version(cfg.id, "1.5.0", None).await.unwrap();
        let v2 = repo.upsert_version(cfg.id, "1.6.0", None).await.unwrap();

        repo.set_latest_version(cfg.id, v1.id).await.unwrap();
        repo.set_latest_version(cfg.id, v2.id).await.unwrap();

        let versions = repo.list_versions(cfg.id).await.unwrap();
        let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "1.6.0");
    }

    #[tokio::test]
    async fn test_upsert_version_is_stable() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tf_mirrors();
        let cfg = repo.create_config(&config("tf")).await.unwrap();
        let a = repo.upsert_version(cfg.id, "1.5.0", None).await.unwrap();
        let b = repo.upsert_version(cfg.id, "1.5.0", None).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_synced_only_listing() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.tf_mirrors();
        let cfg = repo.create_config(&config("tf")).await.unwrap();
        let v1 = repo.upsert_version(cfg.id, "1.5.0", None).await.unwrap();
        let _v2 = repo.upsert_version(cfg.id, "1.6.0", None).await.unwrap();
        repo.update_version_sync_status(v1.id, "synced", None)
            .await
            .unwrap();

        let synced = repo.list_synced_versions(cfg.id).await.unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].version, "1.5.0");
    }
}
