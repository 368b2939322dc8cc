//! Providers, provider versions, and per-platform artifacts.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    encode_string_list, fmt_ts, parse_opt_ts, parse_opt_uuid, parse_string_list, parse_ts,
    parse_uuid, DbError, Result,
};
use crate::semver;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Provider {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub namespace: String,
    pub provider_type: String,
    pub description: String,
    pub source: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderVersion {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub version: String,
    pub protocols: Vec<String>,
    pub gpg_public_key: Option<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub published_by: Option<Uuid>,
    pub deprecated: bool,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub deprecation_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderPlatform {
    pub id: Uuid,
    pub provider_version_id: Uuid,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub shasum: String,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProviderVersion {
    pub provider_id: Uuid,
    pub version: String,
    pub protocols: Vec<String>,
    pub gpg_public_key: Option<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub published_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewProviderPlatform {
    pub provider_version_id: Uuid,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub shasum: String,
}

/// One row of the provider search, with aggregate stats resolved in-query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSearchHit {
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub description: String,
    pub latest_version: Option<String>,
    pub download_count: i64,
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: String,
    organization_id: Option<String>,
    namespace: String,
    r#type: String,
    description: String,
    source: String,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_provider(row: ProviderRow) -> Result<Provider> {
    Ok(Provider {
        id: parse_uuid(&row.id)?,
        organization_id: parse_opt_uuid(row.organization_id)?,
        namespace: row.namespace,
        provider_type: row.r#type,
        description: row.description,
        source: row.source,
        created_by: parse_opt_uuid(row.created_by)?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: String,
    provider_id: String,
    version: String,
    protocols: String,
    gpg_public_key: Option<String>,
    gpg_key_id: Option<String>,
    shasums_url: Option<String>,
    shasums_signature_url: Option<String>,
    published_by: Option<String>,
    deprecated: i64,
    deprecated_at: Option<String>,
    deprecation_message: Option<String>,
    created_at: String,
}

fn row_to_version(row: VersionRow) -> Result<ProviderVersion> {
    Ok(ProviderVersion {
        id: parse_uuid(&row.id)?,
        provider_id: parse_uuid(&row.provider_id)?,
        version: row.version,
        protocols: parse_string_list(Some(row.protocols))?,
        gpg_public_key: row.gpg_public_key,
        gpg_key_id: row.gpg_key_id,
        shasums_url: row.shasums_url,
        shasums_signature_url: row.shasums_signature_url,
        published_by: parse_opt_uuid(row.published_by)?,
        deprecated: row.deprecated != 0,
        deprecated_at: parse_opt_ts(row.deprecated_at)?,
        deprecation_message: row.deprecation_message,
        created_at: parse_ts(&row.created_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct PlatformRow {
    id: String,
    provider_version_id: String,
    os: String,
    arch: String,
    filename: String,
    storage_path: String,
    storage_backend: String,
    size_bytes: i64,
    shasum: String,
    download_count: i64,
    created_at: String,
}

fn row_to_platform(row: PlatformRow) -> Result<ProviderPlatform> {
    Ok(ProviderPlatform {
        id: parse_uuid(&row.id)?,
        provider_version_id: parse_uuid(&row.provider_version_id)?,
        os: row.os,
        arch: row.arch,
        filename: row.filename,
        storage_path: row.storage_path,
        storage_backend: row.storage_backend,
        size_bytes: row.size_bytes,
        shasum: row.shasum,
        download_count: row.download_count,
        created_at: parse_ts(&row.created_at)?,
    })
}

const PROVIDER_COLS: &str =
    "id, organization_id, namespace, type, description, source, created_by, created_at, updated_at";
const VERSION_COLS: &str = "id, provider_id, version, protocols, gpg_public_key, gpg_key_id, \
    shasums_url, shasums_signature_url, published_by, deprecated, deprecated_at, \
    deprecation_message, created_at";
const PLATFORM_COLS: &str = "id, provider_version_id, os, arch, filename, storage_path, \
    storage_backend, size_bytes, shasum, download_count, created_at";

#[derive(Clone, Debug)]
pub struct ProviderRepository {
    pool: SqlitePool,
}

impl ProviderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_provider(
        &self,
        organization_id: Option<Uuid>,
        namespace: &str,
        provider_type: &str,
    ) -> Result<Option<Provider>> {
        let row: Option<ProviderRow> = sqlx::query_as(&format!(
            "SELECT {PROVIDER_COLS} FROM providers
             WHERE organization_id IS ? AND namespace = ? AND type = ?"
        ))
        .bind(organization_id.map(|u| u.to_string()))
        .bind(namespace)
        .bind(provider_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_provider).transpose()
    }

    /// Resolve a provider the way protocol endpoints do: first within the
    /// organization, then among global (mirror-owned) providers.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_provider(
        &self,
        organization_id: Uuid,
        namespace: &str,
        provider_type: &str,
    ) -> Result<Option<Provider>> {
        if let Some(p) = self
            .get_provider(Some(organization_id), namespace, provider_type)
            .await?
        {
            return Ok(Some(p));
        }
        self.get_provider(None, namespace, provider_type).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_provider_by_id(&self, id: Uuid) -> Result<Option<Provider>> {
        let row: Option<ProviderRow> =
            sqlx::query_as(&format!("SELECT {PROVIDER_COLS} FROM providers WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_provider).transpose()
    }

    /// Get-or-create on `(organization_id, namespace, type)`.
    ///
    /// SQLite treats NULLs as distinct in unique constraints, so global
    /// providers go through an explicit lookup first; each mirror config is
    /// the only writer for its providers, which keeps this race-free.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_provider(
        &self,
        organization_id: Option<Uuid>,
        namespace: &str,
        provider_type: &str,
        description: &str,
        source: &str,
        created_by: Option<Uuid>,
    ) -> Result<Provider> {
        if let Some(existing) = self
            .get_provider(organization_id, namespace, provider_type)
            .await?
        {
            return Ok(existing);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO providers (id, organization_id, namespace, type, description, source, \
             created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(organization_id, namespace, type) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(organization_id.map(|u| u.to_string()))
        .bind(namespace)
        .bind(provider_type)
        .bind(description)
        .bind(source)
        .bind(created_by.map(|u| u.to_string()))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost the insert race; the row exists now.
            return self
                .get_provider(organization_id, namespace, provider_type)
                .await?
                .ok_or_else(|| DbError::Internal("provider upsert lost row".to_string()));
        }
        Ok(Provider {
            id,
            organization_id,
            namespace: namespace.to_string(),
            provider_type: provider_type.to_string(),
            description: description.to_string(),
            source: source.to_string(),
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_provider(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM providers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("provider not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, version))]
    pub async fn create_version(&self, version: &NewProviderVersion) -> Result<ProviderVersion> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO provider_versions (id, provider_id, version, protocols, gpg_public_key, \
             gpg_key_id, shasums_url, shasums_signature_url, published_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(version.provider_id.to_string())
        .bind(&version.version)
        .bind(encode_string_list(&version.protocols))
        .bind(&version.gpg_public_key)
        .bind(&version.gpg_key_id)
        .bind(&version.shasums_url)
        .bind(&version.shasums_signature_url)
        .bind(version.published_by.map(|u| u.to_string()))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "provider version already exists"))?;

        Ok(ProviderVersion {
            id,
            provider_id: version.provider_id,
            version: version.version.clone(),
            protocols: version.protocols.clone(),
            gpg_public_key: version.gpg_public_key.clone(),
            gpg_key_id: version.gpg_key_id.clone(),
            shasums_url: version.shasums_url.clone(),
            shasums_signature_url: version.shasums_signature_url.clone(),
            published_by: version.published_by,
            deprecated: false,
            deprecated_at: None,
            deprecation_message: None,
            created_at: now,
        })
    }

    /// All versions of a provider, newest first by semver.
    #[tracing::instrument(skip(self))]
    pub async fn list_versions(&self, provider_id: Uuid) -> Result<Vec<ProviderVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM provider_versions WHERE provider_id = ?"
        ))
        .bind(provider_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut versions = rows
            .into_iter()
            .map(row_to_version)
            .collect::<Result<Vec<_>>>()?;
        semver::sort_descending(&mut versions, |v| &v.version);
        Ok(versions)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_version(
        &self,
        provider_id: Uuid,
        version: &str,
    ) -> Result<Option<ProviderVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM provider_versions WHERE provider_id = ? AND version = ?"
        ))
        .bind(provider_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_version).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn deprecate_version(&self, id: Uuid, message: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE provider_versions SET deprecated = 1, deprecated_at = ?, deprecation_message = ?
             WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("provider version not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_version(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM provider_versions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("provider version not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, platform))]
    pub async fn create_platform(&self, platform: &NewProviderPlatform) -> Result<ProviderPlatform> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO provider_platforms (id, provider_version_id, os, arch, filename, \
             storage_path, storage_backend, size_bytes, shasum, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(platform.provider_version_id.to_string())
        .bind(&platform.os)
        .bind(&platform.arch)
        .bind(&platform.filename)
        .bind(&platform.storage_path)
        .bind(&platform.storage_backend)
        .bind(platform.size_bytes)
        .bind(&platform.shasum)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "platform already exists for this version"))?;
        Ok(ProviderPlatform {
            id,
            provider_version_id: platform.provider_version_id,
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            filename: platform.filename.clone(),
            storage_path: platform.storage_path.clone(),
            storage_backend: platform.storage_backend.clone(),
            size_bytes: platform.size_bytes,
            shasum: platform.shasum.clone(),
            download_count: 0,
            created_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_platforms(&self, provider_version_id: Uuid) -> Result<Vec<ProviderPlatform>> {
        let rows: Vec<PlatformRow> = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLS} FROM provider_platforms
             WHERE provider_version_id = ? ORDER BY os, arch"
        ))
        .bind(provider_version_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_platform).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_platform(
        &self,
        provider_version_id: Uuid,
        os: &str,
        arch: &str,
    ) -> Result<Option<ProviderPlatform>> {
        let row: Option<PlatformRow> = sqlx::query_as(&format!(
            "SELECT {PLATFORM_COLS} FROM provider_platforms
             WHERE provider_version_id = ? AND os = ? AND arch = ?"
        ))
        .bind(provider_version_id.to_string())
        .bind(os)
        .bind(arch)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_platform).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn increment_download_count(&self, platform_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE provider_platforms SET download_count = download_count + 1 WHERE id = ?",
        )
        .bind(platform_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Search with per-row latest version and total download count resolved
    /// by correlated subqueries, avoiding N+1 round trips.
    #[tracing::instrument(skip(self))]
    pub async fn search_with_stats(
        &self,
        organization_id: Option<Uuid>,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProviderSearchHit>> {
        let pattern = format!("%{}%", query.replace('%', "\\%"));
        let rows: Vec<(String, String, String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT p.id, p.namespace, p.type, p.description,
                (SELECT pv.version FROM provider_versions pv
                  WHERE pv.provider_id = p.id ORDER BY pv.created_at DESC LIMIT 1),
                COALESCE((SELECT SUM(pp.download_count)
                  FROM provider_versions pv
                  JOIN provider_platforms pp ON pp.provider_version_id = pv.id
                  WHERE pv.provider_id = p.id), 0)
             FROM providers p
             WHERE (p.organization_id IS ?1 OR p.organization_id IS NULL)
               AND (p.namespace LIKE ?2 ESCAPE '\\' OR p.type LIKE ?2 ESCAPE '\\'
                    OR p.description LIKE ?2 ESCAPE '\\')
             ORDER BY p.namespace, p.type
             LIMIT ?3 OFFSET ?4",
        )
        .bind(organization_id.map(|u| u.to_string()))
        .bind(&pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, namespace, ty, description, latest, downloads)| {
                Ok(ProviderSearchHit {
                    id: parse_uuid(&id)?,
                    namespace,
                    provider_type: ty,
                    description,
                    latest_version: latest,
                    download_count: downloads,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn seed_provider(db: &Database) -> Provider {
        db.providers()
            .upsert_provider(None, "hashicorp", "aws", "AWS provider", "", None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_stable() {
        let db = Database::in_memory().await.unwrap();
        let first = seed_provider(&db).await;
        let second = seed_provider(&db).await;
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_versions_sorted_semver_descending() {
        let db = Database::in_memory().await.unwrap();
        let provider = seed_provider(&db).await;
        for v in ["1.2.0", "1.10.0", "0.9.9"] {
            db.providers()
                .create_version(&NewProviderVersion {
                    provider_id: provider.id,
                    version: v.to_string(),
                    protocols: vec!["5.0".to_string()],
                    gpg_public_key: None,
                    gpg_key_id: None,
                    shasums_url: None,
                    shasums_signature_url: None,
                    published_by: None,
                })
                .await
                .unwrap();
        }
        let versions = db.providers().list_versions(provider.id).await.unwrap();
        let order: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, vec!["1.10.0", "1.2.0", "0.9.9"]);
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let db = Database::in_memory().await.unwrap();
        let provider = seed_provider(&db).await;
        let version = NewProviderVersion {
            provider_id: provider.id,
            version: "1.0.0".to_string(),
            protocols: vec![],
            gpg_public_key: None,
            gpg_key_id: None,
            shasums_url: None,
            shasums_signature_url: None,
            published_by: None,
        };
        db.providers().create_version(&version).await.unwrap();
        assert!(matches!(
            db.providers().create_version(&version).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_search_with_stats() {
        let db = Database::in_memory().await.unwrap();
        let provider = seed_provider(&db).await;
        let v = db
            .providers()
            .create_version(&NewProviderVersion {
                provider_id: provider.id,
                version: "1.0.0".to_string(),
                protocols: vec![],
                gpg_public_key: None,
                gpg_key_id: None,
                shasums_url: None,
                shasums_signature_url: None,
                published_by: None,
            })
            .await
            .unwrap();
        let platform = db
            .providers()
            .create_platform(&NewProviderPlatform {
                provider_version_id: v.id,
                os: "linux".to_string(),
                arch: "amd64".to_string(),
                filename: "terraform-provider-aws_1.0.0_linux_amd64.zip".to_string(),
                storage_path: "providers/hashicorp/aws/1.0.0/x.zip".to_string(),
                storage_backend: "local".to_string(),
                size_bytes: 10,
                shasum: "ab".repeat(32),
            })
            .await
            .unwrap();
        db.providers()
            .increment_download_count(platform.id)
            .await
            .unwrap();

        let hits = db
            .providers()
            .search_with_stats(None, "aws", 10, 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].latest_version.as_deref(), Some("1.0.0"));
        assert_eq!(hits[0].download_count, 1);
    }
}
