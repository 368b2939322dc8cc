//! Modules and module versions.
//!
//! `upsert_module` uses the `(organization_id, namespace, name, system)`
//! unique tuple so concurrent tag publishes converge on one row.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_uuid, parse_ts, parse_uuid, DbError, Result};
use crate::semver;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Module {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub namespace: String,
    pub name: String,
    pub system: String,
    pub description: String,
    pub source: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModuleVersion {
    pub id: Uuid,
    pub module_id: Uuid,
    pub version: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub readme: Option<String>,
    pub published_by: Option<Uuid>,
    pub download_count: i64,
    pub deprecated: bool,
    pub commit_sha: Option<String>,
    pub tag_name: Option<String>,
    pub scm_repo_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewModuleVersion {
    pub module_id: Uuid,
    pub version: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub readme: Option<String>,
    pub published_by: Option<Uuid>,
    pub commit_sha: Option<String>,
    pub tag_name: Option<String>,
    pub scm_repo_id: Option<Uuid>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModuleSearchHit {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub system: String,
    pub description: String,
    pub latest_version: Option<String>,
    pub download_count: i64,
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    id: String,
    organization_id: String,
    namespace: String,
    name: String,
    system: String,
    description: String,
    source: String,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_module(row: ModuleRow) -> Result<Module> {
    Ok(Module {
        id: parse_uuid(&row.id)?,
        organization_id: parse_uuid(&row.organization_id)?,
        namespace: row.namespace,
        name: row.name,
        system: row.system,
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
    module_id: String,
    version: String,
    storage_path: String,
    storage_backend: String,
    size_bytes: i64,
    checksum: String,
    readme: Option<String>,
    published_by: Option<String>,
    download_count: i64,
    deprecated: i64,
    commit_sha: Option<String>,
    tag_name: Option<String>,
    scm_repo_id: Option<String>,
    created_at: String,
}

fn row_to_version(row: VersionRow) -> Result<ModuleVersion> {
    Ok(ModuleVersion {
        id: parse_uuid(&row.id)?,
        module_id: parse_uuid(&row.module_id)?,
        version: row.version,
        storage_path: row.storage_path,
        storage_backend: row.storage_backend,
        size_bytes: row.size_bytes,
        checksum: row.checksum,
        readme: row.readme,
        published_by: parse_opt_uuid(row.published_by)?,
        download_count: row.download_count,
        deprecated: row.deprecated != 0,
        commit_sha: row.commit_sha,
        tag_name: row.tag_name,
        scm_repo_id: parse_opt_uuid(row.scm_repo_id)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

const MODULE_COLS: &str = "id, organization_id, namespace, name, system, description, source, \
    created_by, created_at, updated_at";
const VERSION_COLS: &str = "id, module_id, version, storage_path, storage_backend, size_bytes, \
    checksum, readme, published_by, download_count, deprecated, commit_sha, tag_name, \
    scm_repo_id, created_at";

#[derive(Clone, Debug)]
pub struct ModuleRepository {
    pool: SqlitePool,
}

impl ModuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get-or-create on the unique coordinate tuple. Safe under concurrent
    /// tag publishes: the loser of the insert race reads the winner's row.
    #[tracing::instrument(skip(self))]
    pub async fn upsert_module(
        &self,
        organization_id: Uuid,
        namespace: &str,
        name: &str,
        system: &str,
        description: &str,
        source: &str,
        created_by: Option<Uuid>,
    ) -> Result<Module> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO modules (id, organization_id, namespace, name, system, description, \
             source, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(organization_id, namespace, name, system) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(organization_id.to_string())
        .bind(namespace)
        .bind(name)
        .bind(system)
        .bind(description)
        .bind(source)
        .bind(created_by.map(|u| u.to_string()))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return self
                .get_module(organization_id, namespace, name, system)
                .await?
                .ok_or_else(|| DbError::Internal("module upsert lost row".to_string()));
        }
        Ok(Module {
            id,
            organization_id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            system: system.to_string(),
            description: description.to_string(),
            source: source.to_string(),
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_module(
        &self,
        organization_id: Uuid,
        namespace: &str,
        name: &str,
        system: &str,
    ) -> Result<Option<Module>> {
        let row: Option<ModuleRow> = sqlx::query_as(&format!(
            "SELECT {MODULE_COLS} FROM modules
             WHERE organization_id = ? AND namespace = ? AND name = ? AND system = ?"
        ))
        .bind(organization_id.to_string())
        .bind(namespace)
        .bind(name)
        .bind(system)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_module).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Module>> {
        let row: Option<ModuleRow> =
            sqlx::query_as(&format!("SELECT {MODULE_COLS} FROM modules WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_module).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM modules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("module not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, version), fields(version = %version.version))]
    pub async fn create_version(&self, version: &NewModuleVersion) -> Result<ModuleVersion> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO module_versions (id, module_id, version, storage_path, storage_backend, \
             size_bytes, checksum, readme, published_by, commit_sha, tag_name, scm_repo_id, \
             created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(version.module_id.to_string())
        .bind(&version.version)
        .bind(&version.storage_path)
        .bind(&version.storage_backend)
        .bind(version.size_bytes)
        .bind(&version.checksum)
        .bind(&version.readme)
        .bind(version.published_by.map(|u| u.to_string()))
        .bind(&version.commit_sha)
        .bind(&version.tag_name)
        .bind(version.scm_repo_id.map(|u| u.to_string()))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "module version already exists"))?;

        Ok(ModuleVersion {
            id,
            module_id: version.module_id,
            version: version.version.clone(),
            storage_path: version.storage_path.clone(),
            storage_backend: version.storage_backend.clone(),
            size_bytes: version.size_bytes,
            checksum: version.checksum.clone(),
            readme: version.readme.clone(),
            published_by: version.published_by,
            download_count: 0,
            deprecated: false,
            commit_sha: version.commit_sha.clone(),
            tag_name: version.tag_name.clone(),
            scm_repo_id: version.scm_repo_id,
            created_at: now,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_version(&self, module_id: Uuid, version: &str) -> Result<Option<ModuleVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM module_versions WHERE module_id = ? AND version = ?"
        ))
        .bind(module_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_version).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_version_by_id(&self, id: Uuid) -> Result<Option<ModuleVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM module_versions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_version).transpose()
    }

    /// All versions of a module, newest first by semver.
    #[tracing::instrument(skip(self))]
    pub async fn list_versions(&self, module_id: Uuid) -> Result<Vec<ModuleVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM module_versions WHERE module_id = ?"
        ))
        .bind(module_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut versions = rows
            .into_iter()
            .map(row_to_version)
            .collect::<Result<Vec<_>>>()?;
        semver::sort_descending(&mut versions, |v| &v.version);
        Ok(versions)
    }

    /// Versions published from SCM tags, the audit worker's input.
    #[tracing::instrument(skip(self))]
    pub async fn list_scm_sourced_versions(&self) -> Result<Vec<ModuleVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLS} FROM module_versions
             WHERE commit_sha IS NOT NULL AND scm_repo_id IS NOT NULL AND tag_name IS NOT NULL"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_version).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn increment_download_count(&self, version_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE module_versions SET download_count = download_count + 1 WHERE id = ?")
            .bind(version_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_version(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM module_versions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("module version not found".to_string()));
        }
        Ok(())
    }

    /// Search with latest version and summed downloads resolved in-query.
    #[tracing::instrument(skip(self))]
    pub async fn search_with_stats(
        &self,
        organization_id: Uuid,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ModuleSearchHit>> {
        let pattern = format!("%{}%", query.replace('%', "\\%"));
        let rows: Vec<(String, String, String, String, String, Option<String>, i64)> =
            sqlx::query_as(
                "SELECT m.id, m.namespace, m.name, m.system, m.description,
                    (SELECT mv.version FROM module_versions mv
                      WHERE mv.module_id = m.id ORDER BY mv.created_at DESC LIMIT 1),
                    COALESCE((SELECT SUM(mv.download_count) FROM module_versions mv
                      WHERE mv.module_id = m.id), 0)
                 FROM modules m
                 WHERE m.organization_id = ?1
                   AND (m.namespace LIKE ?2 ESCAPE '\\' OR m.name LIKE ?2 ESCAPE '\\'
                        OR m.description LIKE ?2 ESCAPE '\\')
                 ORDER BY m.namespace, m.name, m.system
                 LIMIT ?3 OFFSET ?4",
            )
            .bind(organization_id.to_string())
            .bind(&pattern)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(id, namespace, name, system, description, latest, downloads)| {
                Ok(ModuleSearchHit {
                    id: parse_uuid(&id)?,
                    namespace,
                    name,
                    system,
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

    async fn seed(db: &Database) -> Module {
        let org = db.organizations().default_org().await.unwrap();
        db.modules()
            .upsert_module(org.id, "hashicorp", "vpc", "aws", "", "", None)
            .await
            .unwrap()
    }

    fn version(module_id: Uuid, v: &str) -> NewModuleVersion {
        NewModuleVersion {
            module_id,
            version: v.to_string(),
            storage_path: format!("modules/hashicorp/vpc/aws/vpc-{v}.tar.gz"),
            storage_backend: "local".to_string(),
            size_bytes: 128,
            checksum: "cd".repeat(32),
            readme: None,
            published_by: None,
            commit_sha: None,
            tag_name: None,
            scm_repo_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_converges_on_one_row() {
        let db = Database::in_memory().await.unwrap();
        let first = seed(&db).await;
        let second = seed(&db).await;
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_duplicate_version_is_conflict() {
        let db = Database::in_memory().await.unwrap();
        let module = seed(&db).await;
        db.modules()
            .create_version(&version(module.id, "1.0.0"))
            .await
            .unwrap();
        assert!(matches!(
            db.modules().create_version(&version(module.id, "1.0.0")).await,
            Err(DbError::Conflict(_))
        ));
        // Exactly one row survives.
        assert_eq!(db.modules().list_versions(module.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_versions_sorted_descending() {
        let db = Database::in_memory().await.unwrap();
        let module = seed(&db).await;
        for v in ["0.1.0", "2.0.0", "0.10.0"] {
            db.modules().create_version(&version(module.id, v)).await.unwrap();
        }
        let versions = db.modules().list_versions(module.id).await.unwrap();
        let order: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, vec!["2.0.0", "0.10.0", "0.1.0"]);
    }
}
