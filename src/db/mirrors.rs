//! Provider mirror configurations and their tracking records.
//!
//! Covers the mirror configs themselves, the mirrored provider/version
//! bookkeeping, sync history, approval requests, and mirror policies.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, DbError, Result};

/// Mirror sync state machine values stored on configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failed,
    InProgress,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MirrorConfig {
    pub id: Uuid,
    pub name: String,
    pub upstream_registry_url: String,
    pub organization_id: Option<Uuid>,
    pub namespace_filter: Option<String>,
    pub provider_filter: Option<String>,
    pub version_filter: Option<String>,
    pub platform_filter: Option<String>,
    pub enabled: bool,
    pub sync_interval_hours: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMirrorConfig {
    pub name: String,
    pub upstream_registry_url: String,
    pub organization_id: Option<Uuid>,
    pub namespace_filter: Option<String>,
    pub provider_filter: Option<String>,
    pub version_filter: Option<String>,
    pub platform_filter: Option<String>,
    pub enabled: bool,
    pub sync_interval_hours: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MirroredProvider {
    pub id: Uuid,
    pub mirror_config_id: Uuid,
    pub provider_id: Uuid,
    pub upstream_namespace: String,
    pub upstream_type: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MirrorSyncHistory {
    pub id: Uuid,
    pub config_id: Uuid,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub providers_synced: i64,
    pub versions_synced: i64,
    pub versions_failed: i64,
    pub error_message: Option<String>,
    pub sync_details: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MirrorApprovalRequest {
    pub id: Uuid,
    pub mirror_config_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub requested_by: Option<Uuid>,
    pub provider_namespace: String,
    pub provider_name: Option<String>,
    pub reason: Option<String>,
    pub status: String,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub auto_approved: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MirrorPolicy {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub policy_type: String,
    pub upstream_registry: Option<String>,
    pub namespace_pattern: Option<String>,
    pub provider_pattern: Option<String>,
    pub priority: i64,
    pub is_active: bool,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMirrorPolicy {
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub policy_type: String,
    pub upstream_registry: Option<String>,
    pub namespace_pattern: Option<String>,
    pub provider_pattern: Option<String>,
    pub priority: i64,
    pub requires_approval: bool,
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: String,
    name: String,
    upstream_registry_url: String,
    organization_id: Option<String>,
    namespace_filter: Option<String>,
    provider_filter: Option<String>,
    version_filter: Option<String>,
    platform_filter: Option<String>,
    enabled: i64,
    sync_interval_hours: i64,
    last_sync_at: Option<String>,
    last_sync_status: Option<String>,
    last_sync_error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_config(row: ConfigRow) -> Result<MirrorConfig> {
    Ok(MirrorConfig {
        id: parse_uuid(&row.id)?,
        name: row.name,
        upstream_registry_url: row.upstream_registry_url,
        organization_id: parse_opt_uuid(row.organization_id)?,
        namespace_filter: row.namespace_filter,
        provider_filter: row.provider_filter,
        version_filter: row.version_filter,
        platform_filter: row.platform_filter,
        enabled: row.enabled != 0,
        sync_interval_hours: row.sync_interval_hours,
        last_sync_at: parse_opt_ts(row.last_sync_at)?,
        last_sync_status: row.last_sync_status,
        last_sync_error: row.last_sync_error,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    mirror_config_id: String,
    organization_id: Option<String>,
    requested_by: Option<String>,
    provider_namespace: String,
    provider_name: Option<String>,
    reason: Option<String>,
    status: String,
    reviewed_by: Option<String>,
    reviewed_at: Option<String>,
    review_notes: Option<String>,
    auto_approved: i64,
    expires_at: Option<String>,
    created_at: String,
}

fn row_to_approval(row: ApprovalRow) -> Result<MirrorApprovalRequest> {
    Ok(MirrorApprovalRequest {
        id: parse_uuid(&row.id)?,
        mirror_config_id: parse_uuid(&row.mirror_config_id)?,
        organization_id: parse_opt_uuid(row.organization_id)?,
        requested_by: parse_opt_uuid(row.requested_by)?,
        provider_namespace: row.provider_namespace,
        provider_name: row.provider_name,
        reason: row.reason,
        status: row.status,
        reviewed_by: parse_opt_uuid(row.reviewed_by)?,
        reviewed_at: parse_opt_ts(row.reviewed_at)?,
        review_notes: row.review_notes,
        auto_approved: row.auto_approved != 0,
        expires_at: parse_opt_ts(row.expires_at)?,
        created_at: parse_ts(&row.created_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    organization_id: Option<String>,
    name: String,
    description: String,
    policy_type: String,
    upstream_registry: Option<String>,
    namespace_pattern: Option<String>,
    provider_pattern: Option<String>,
    priority: i64,
    is_active: i64,
    requires_approval: i64,
    created_at: String,
    updated_at: String,
}

fn row_to_policy(row: PolicyRow) -> Result<MirrorPolicy> {
    Ok(MirrorPolicy {
        id: parse_uuid(&row.id)?,
        organization_id: parse_opt_uuid(row.organization_id)?,
        name: row.name,
        description: row.description,
        policy_type: row.policy_type,
        upstream_registry: row.upstream_registry,
        namespace_pattern: row.namespace_pattern,
        provider_pattern: row.provider_pattern,
        priority: row.priority,
        is_active: row.is_active != 0,
        requires_approval: row.requires_approval != 0,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

const CONFIG_COLS: &str = "id, name, upstream_registry_url, organization_id, namespace_filter, \
    provider_filter, version_filter, platform_filter, enabled, sync_interval_hours, \
    last_sync_at, last_sync_status, last_sync_error, created_at, updated_at";
const APPROVAL_COLS: &str = "id, mirror_config_id, organization_id, requested_by, \
    provider_namespace, provider_name, reason, status, reviewed_by, reviewed_at, review_notes, \
    auto_approved, expires_at, created_at";
const POLICY_COLS: &str = "id, organization_id, name, description, policy_type, \
    upstream_registry, namespace_pattern, provider_pattern, priority, is_active, \
    requires_approval, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct MirrorRepository {
    pool: SqlitePool,
}

impl MirrorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, config), fields(name = %config.name))]
    pub async fn create_config(&self, config: &NewMirrorConfig) -> Result<MirrorConfig> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO mirror_configs (id, name, upstream_registry_url, organization_id, \
             namespace_filter, provider_filter, version_filter, platform_filter, enabled, \
             sync_interval_hours, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&config.name)
        .bind(&config.upstream_registry_url)
        .bind(config.organization_id.map(|u| u.to_string()))
        .bind(&config.namespace_filter)
        .bind(&config.provider_filter)
        .bind(&config.version_filter)
        .bind(&config.platform_filter)
        .bind(config.enabled as i64)
        .bind(config.sync_interval_hours)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "mirror config with this name already exists"))?;
        self.get_config(id)
            .await?
            .ok_or_else(|| DbError::Internal("mirror config vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_config(&self, id: Uuid) -> Result<Option<MirrorConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM mirror_configs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_config).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_configs(&self) -> Result<Vec<MirrorConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM mirror_configs ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_config).collect()
    }

    /// Configs due for a sync pass: enabled, not currently syncing, and past
    /// their interval (or never synced). Never-synced rows sort first.
    #[tracing::instrument(skip(self))]
    pub async fn get_configs_needing_sync(&self) -> Result<Vec<MirrorConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLS} FROM mirror_configs
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
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let stamp = match status {
            // Completion stamps last_sync_at; entering in_progress does not.
            SyncStatus::InProgress => None,
            _ => Some(fmt_ts(Utc::now())),
        };
        sqlx::query(
            "UPDATE mirror_configs
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
    pub async fn update_config(&self, id: Uuid, config: &NewMirrorConfig) -> Result<()> {
        let result = sqlx::query(
            "UPDATE mirror_configs SET name = ?, upstream_registry_url = ?, namespace_filter = ?, \
             provider_filter = ?, version_filter = ?, platform_filter = ?, enabled = ?, \
             sync_interval_hours = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&config.name)
        .bind(&config.upstream_registry_url)
        .bind(&config.namespace_filter)
        .bind(&config.provider_filter)
        .bind(&config.version_filter)
        .bind(&config.platform_filter)
        .bind(config.enabled as i64)
        .bind(config.sync_interval_hours)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("mirror config not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_config(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM mirror_configs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("mirror config not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn upsert_mirrored_provider(
        &self,
        mirror_config_id: Uuid,
        provider_id: Uuid,
        upstream_namespace: &str,
        upstream_type: &str,
    ) -> Result<MirroredProvider> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO mirrored_providers (id, mirror_config_id, provider_id, \
             upstream_namespace, upstream_type, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(mirror_config_id, upstream_namespace, upstream_type) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(mirror_config_id.to_string())
        .bind(provider_id.to_string())
        .bind(upstream_namespace)
        .bind(upstream_type)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        let row: (String, String, Option<String>, i64) = sqlx::query_as(
            "SELECT id, provider_id, last_synced_at, sync_enabled FROM mirrored_providers
             WHERE mirror_config_id = ? AND upstream_namespace = ? AND upstream_type = ?",
        )
        .bind(mirror_config_id.to_string())
        .bind(upstream_namespace)
        .bind(upstream_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(MirroredProvider {
            id: parse_uuid(&row.0)?,
            mirror_config_id,
            provider_id: parse_uuid(&row.1)?,
            upstream_namespace: upstream_namespace.to_string(),
            upstream_type: upstream_type.to_string(),
            last_synced_at: parse_opt_ts(row.2)?,
            sync_enabled: row.3 != 0,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn touch_mirrored_provider(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE mirrored_providers SET last_synced_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upstream versions already recorded for a mirrored provider.
    #[tracing::instrument(skip(self))]
    pub async fn list_mirrored_versions(&self, mirrored_provider_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT upstream_version FROM mirrored_provider_versions WHERE mirrored_provider_id = ?",
        )
        .bind(mirrored_provider_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    #[tracing::instrument(skip(self))]
    pub async fn upsert_mirrored_version(
        &self,
        mirrored_provider_id: Uuid,
        provider_version_id: Uuid,
        upstream_version: &str,
        shasum_verified: bool,
        gpg_verified: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mirrored_provider_versions (id, mirrored_provider_id, \
             provider_version_id, upstream_version, synced_at, shasum_verified, gpg_verified)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(mirrored_provider_id, upstream_version) DO UPDATE SET
                 provider_version_id = excluded.provider_version_id,
                 synced_at = excluded.synced_at,
                 shasum_verified = excluded.shasum_verified,
                 gpg_verified = excluded.gpg_verified",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(mirrored_provider_id.to_string())
        .bind(provider_version_id.to_string())
        .bind(upstream_version)
        .bind(fmt_ts(Utc::now()))
        .bind(shasum_verified as i64)
        .bind(gpg_verified as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_sync_history(&self, config_id: Uuid, triggered_by: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO mirror_sync_history (id, config_id, triggered_by, started_at, status)
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
        providers_synced: i64,
        versions_synced: i64,
        versions_failed: i64,
        error_message: Option<&str>,
        sync_details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE mirror_sync_history SET completed_at = ?, status = ?, providers_synced = ?, \
             versions_synced = ?, versions_failed = ?, error_message = ?, sync_details = ?
             WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(status)
        .bind(providers_synced)
        .bind(versions_synced)
        .bind(versions_failed)
        .bind(error_message)
        .bind(sync_details)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_sync_history(&self, config_id: Uuid, limit: i64) -> Result<Vec<MirrorSyncHistory>> {
        let rows: Vec<(
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            i64,
            i64,
            i64,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT id, config_id, triggered_by, started_at, completed_at, status, \
             providers_synced, versions_synced, versions_failed, error_message, sync_details
             FROM mirror_sync_history WHERE config_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(config_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(MirrorSyncHistory {
                    id: parse_uuid(&r.0)?,
                    config_id: parse_uuid(&r.1)?,
                    triggered_by: r.2,
                    started_at: parse_ts(&r.3)?,
                    completed_at: parse_opt_ts(r.4)?,
                    status: r.5,
                    providers_synced: r.6,
                    versions_synced: r.7,
                    versions_failed: r.8,
                    error_message: r.9,
                    sync_details: r.10,
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, reason))]
    pub async fn create_approval(
        &self,
        mirror_config_id: Uuid,
        organization_id: Option<Uuid>,
        requested_by: Option<Uuid>,
        provider_namespace: &str,
        provider_name: Option<&str>,
        reason: Option<&str>,
        auto_approved: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<MirrorApprovalRequest> {
        let id = Uuid::new_v4();
        let status = if auto_approved { "approved" } else { "pending" };
        sqlx::query(
            "INSERT INTO mirror_approval_requests (id, mirror_config_id, organization_id, \
             requested_by, provider_namespace, provider_name, reason, status, auto_approved, \
             expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(mirror_config_id.to_string())
        .bind(organization_id.map(|u| u.to_string()))
        .bind(requested_by.map(|u| u.to_string()))
        .bind(provider_namespace)
        .bind(provider_name)
        .bind(reason)
        .bind(status)
        .bind(auto_approved as i64)
        .bind(expires_at.map(fmt_ts))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        self.get_approval_by_id(id)
            .await?
            .ok_or_else(|| DbError::Internal("approval vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_approval_by_id(&self, id: Uuid) -> Result<Option<MirrorApprovalRequest>> {
        let row: Option<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {APPROVAL_COLS} FROM mirror_approval_requests WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_approval).transpose()
    }

    #[tracing::instrument(skip(self, notes))]
    pub async fn review_approval(
        &self,
        id: Uuid,
        status: &str,
        reviewed_by: Uuid,
        notes: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE mirror_approval_requests SET status = ?, reviewed_by = ?, reviewed_at = ?, \
             review_notes = ? WHERE id = ?",
        )
        .bind(status)
        .bind(reviewed_by.to_string())
        .bind(fmt_ts(Utc::now()))
        .bind(notes)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("approval request not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_approvals(
        &self,
        mirror_config_id: Option<Uuid>,
        status: Option<&str>,
    ) -> Result<Vec<MirrorApprovalRequest>> {
        let rows: Vec<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {APPROVAL_COLS} FROM mirror_approval_requests
             WHERE (?1 IS NULL OR mirror_config_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC"
        ))
        .bind(mirror_config_id.map(|u| u.to_string()))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_approval).collect()
    }

    /// Most specific non-expired approved request covering this provider:
    /// a provider-level row wins over a namespace-wide one.
    #[tracing::instrument(skip(self))]
    pub async fn get_approval(
        &self,
        mirror_config_id: Uuid,
        namespace: &str,
        provider: &str,
    ) -> Result<Option<MirrorApprovalRequest>> {
        let row: Option<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {APPROVAL_COLS} FROM mirror_approval_requests
             WHERE mirror_config_id = ? AND status = 'approved'
               AND provider_namespace = ?
               AND (provider_name IS NULL OR provider_name = ?)
               AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY provider_name IS NULL, created_at DESC
             LIMIT 1"
        ))
        .bind(mirror_config_id.to_string())
        .bind(namespace)
        .bind(provider)
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_approval).transpose()
    }

    #[tracing::instrument(skip(self, policy), fields(name = %policy.name))]
    pub async fn create_policy(&self, policy: &NewMirrorPolicy) -> Result<MirrorPolicy> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO mirror_policies (id, organization_id, name, description, policy_type, \
             upstream_registry, namespace_pattern, provider_pattern, priority, is_active, \
             requires_approval, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(policy.organization_id.map(|u| u.to_string()))
        .bind(&policy.name)
        .bind(&policy.description)
        .bind(&policy.policy_type)
        .bind(&policy.upstream_registry)
        .bind(&policy.namespace_pattern)
        .bind(&policy.provider_pattern)
        .bind(policy.priority)
        .bind(policy.requires_approval as i64)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        let row: Option<PolicyRow> = sqlx::query_as(&format!(
            "SELECT {POLICY_COLS} FROM mirror_policies WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_policy)
            .transpose()?
            .ok_or_else(|| DbError::Internal("policy vanished after insert".to_string()))
    }

    /// Active policies visible to an organization (global plus own), in
    /// evaluation order: `priority DESC, created_at ASC`.
    #[tracing::instrument(skip(self))]
    pub async fn list_active_policies(
        &self,
        organization_id: Option<Uuid>,
    ) -> Result<Vec<MirrorPolicy>> {
        let rows: Vec<PolicyRow> = sqlx::query_as(&format!(
            "SELECT {POLICY_COLS} FROM mirror_policies
             WHERE is_active = 1 AND (organization_id IS NULL OR organization_id IS ?)
             ORDER BY priority DESC, created_at ASC"
        ))
        .bind(organization_id.map(|u| u.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_policy).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_policies(&self) -> Result<Vec<MirrorPolicy>> {
        let rows: Vec<PolicyRow> = sqlx::query_as(&format!(
            "SELECT {POLICY_COLS} FROM mirror_policies ORDER BY priority DESC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_policy).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_policy_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE mirror_policies SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active as i64)
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("mirror policy not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_policy(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM mirror_policies WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("mirror policy not found".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn config(name: &str) -> NewMirrorConfig {
        NewMirrorConfig {
            name: name.to_string(),
            upstream_registry_url: "https://registry.terraform.io".to_string(),
            organization_id: None,
            namespace_filter: Some("hashicorp".to_string()),
            provider_filter: None,
            version_filter: None,
            platform_filter: None,
            enabled: true,
            sync_interval_hours: 1,
        }
    }

    #[tokio::test]
    async fn test_needing_sync_excludes_in_progress() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.mirrors();
        let a = repo.create_config(&config("a")).await.unwrap();
        let b = repo.create_config(&config("b")).await.unwrap();

        // Both never synced: both due.
        let due = repo.get_configs_needing_sync().await.unwrap();
        assert_eq!(due.len(), 2);

        repo.update_sync_status(a.id, SyncStatus::InProgress, None)
            .await
            .unwrap();
        let due = repo.get_configs_needing_sync().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, b.id);
        assert!(due.iter().all(|c| c.last_sync_status.as_deref() != Some("in_progress")));

        // A fresh success is not due until its interval passes.
        repo.update_sync_status(a.id, SyncStatus::Success, None)
            .await
            .unwrap();
        let due = repo.get_configs_needing_sync().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, b.id);
    }

    #[tokio::test]
    async fn test_mirrored_version_upsert_unique() {
        let db = Database::in_memory().await.unwrap();
        let cfg = db.mirrors().create_config(&config("m")).await.unwrap();
        let provider = db
            .providers()
            .upsert_provider(None, "hashicorp", "aws", "", "", None)
            .await
            .unwrap();
        let mirrored = db
            .mirrors()
            .upsert_mirrored_provider(cfg.id, provider.id, "hashicorp", "aws")
            .await
            .unwrap();

        let version_id = Uuid::new_v4();
        db.mirrors()
            .upsert_mirrored_version(mirrored.id, version_id, "1.0.0", true, false)
            .await
            .unwrap();
        db.mirrors()
            .upsert_mirrored_version(mirrored.id, version_id, "1.0.0", true, true)
            .await
            .unwrap();
        let versions = db.mirrors().list_mirrored_versions(mirrored.id).await.unwrap();
        assert_eq!(versions, vec!["1.0.0".to_string()]);
    }

    #[tokio::test]
    async fn test_approval_lookup_prefers_specific() {
        let db = Database::in_memory().await.unwrap();
        let cfg = db.mirrors().create_config(&config("m")).await.unwrap();
        let wide = db
            .mirrors()
            .create_approval(cfg.id, None, None, "hashicorp", None, None, true, None)
            .await
            .unwrap();
        let narrow = db
            .mirrors()
            .create_approval(cfg.id, None, None, "hashicorp", Some("aws"), None, true, None)
            .await
            .unwrap();

        let found = db
            .mirrors()
            .get_approval(cfg.id, "hashicorp", "aws")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, narrow.id);

        // Other providers in the namespace fall back to the wide approval.
        let fallback = db
            .mirrors()
            .get_approval(cfg.id, "hashicorp", "google")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.id, wide.id);
    }

    #[tokio::test]
    async fn test_expired_approval_is_invisible() {
        let db = Database::in_memory().await.unwrap();
        let cfg = db.mirrors().create_config(&config("m")).await.unwrap();
        db.mirrors()
            .create_approval(
                cfg.id,
                None,
                None,
                "hashicorp",
                Some("aws"),
                None,
                true,
                Some(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert!(db
            .mirrors()
            .get_approval(cfg.id, "hashicorp", "aws")
            .await
            .unwrap()
            .is_none());
    }
}
