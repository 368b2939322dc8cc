//! SCM providers, user tokens, module repository links, webhook event log,
//! and tag immutability alerts.
//!
//! Columns suffixed `_encrypted` are opaque blobs here; the token cipher is
//! applied by the narrowest caller that needs the plaintext.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{fmt_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, DbError, Result};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScmProvider {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider_type: String,
    pub name: String,
    pub base_url: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_encrypted: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScmProvider {
    pub organization_id: Uuid,
    pub provider_type: String,
    pub name: String,
    pub base_url: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: String,
    pub client_secret_encrypted: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScmUserToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scm_provider_id: Uuid,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModuleScmRepo {
    pub id: Uuid,
    pub module_id: Uuid,
    pub scm_provider_id: Uuid,
    pub repository_owner: String,
    pub repository_name: String,
    pub default_branch: String,
    pub module_path: String,
    pub tag_pattern: String,
    pub auto_publish: bool,
    pub webhook_id: Option<String>,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub webhook_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewModuleScmRepo {
    pub module_id: Uuid,
    pub scm_provider_id: Uuid,
    pub repository_owner: String,
    pub repository_name: String,
    pub default_branch: String,
    pub module_path: String,
    pub tag_pattern: String,
    pub auto_publish: bool,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScmWebhookEvent {
    pub id: Uuid,
    pub module_scm_repo_id: Uuid,
    pub event_id: Option<String>,
    pub event_type: String,
    pub ref_name: Option<String>,
    pub commit_sha: Option<String>,
    pub tag_name: Option<String>,
    pub payload: String,
    pub headers: String,
    pub signature: Option<String>,
    pub signature_valid: bool,
    pub processed: bool,
    pub status: String,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result_version_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScmWebhookEvent {
    pub module_scm_repo_id: Uuid,
    pub event_id: Option<String>,
    pub event_type: String,
    pub ref_name: Option<String>,
    pub commit_sha: Option<String>,
    pub tag_name: Option<String>,
    pub payload: String,
    pub headers: String,
    pub signature: Option<String>,
    pub signature_valid: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TagImmutabilityAlert {
    pub id: Uuid,
    pub module_version_id: Uuid,
    pub tag_name: String,
    pub original_commit_sha: String,
    pub detected_commit_sha: String,
    pub detected_at: DateTime<Utc>,
    pub alert_sent: bool,
    pub resolved: bool,
    pub resolved_by: Option<Uuid>,
    pub notes: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: String,
    organization_id: String,
    provider_type: String,
    name: String,
    base_url: Option<String>,
    tenant_id: Option<String>,
    client_id: String,
    client_secret_encrypted: Option<String>,
    webhook_secret: Option<String>,
    is_active: i64,
    created_at: String,
    updated_at: String,
}

fn row_to_provider(row: ProviderRow) -> Result<ScmProvider> {
    Ok(ScmProvider {
        id: parse_uuid(&row.id)?,
        organization_id: parse_uuid(&row.organization_id)?,
        provider_type: row.provider_type,
        name: row.name,
        base_url: row.base_url,
        tenant_id: row.tenant_id,
        client_id: row.client_id,
        client_secret_encrypted: row.client_secret_encrypted,
        webhook_secret: row.webhook_secret,
        is_active: row.is_active != 0,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct RepoLinkRow {
    id: String,
    module_id: String,
    scm_provider_id: String,
    repository_owner: String,
    repository_name: String,
    default_branch: String,
    module_path: String,
    tag_pattern: String,
    auto_publish: i64,
    webhook_id: Option<String>,
    webhook_url: Option<String>,
    webhook_secret: String,
    webhook_enabled: i64,
    last_sync_at: Option<String>,
    last_sync_commit: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_repo_link(row: RepoLinkRow) -> Result<ModuleScmRepo> {
    Ok(ModuleScmRepo {
        id: parse_uuid(&row.id)?,
        module_id: parse_uuid(&row.module_id)?,
        scm_provider_id: parse_uuid(&row.scm_provider_id)?,
        repository_owner: row.repository_owner,
        repository_name: row.repository_name,
        default_branch: row.default_branch,
        module_path: row.module_path,
        tag_pattern: row.tag_pattern,
        auto_publish: row.auto_publish != 0,
        webhook_id: row.webhook_id,
        webhook_url: row.webhook_url,
        webhook_secret: row.webhook_secret,
        webhook_enabled: row.webhook_enabled != 0,
        last_sync_at: parse_opt_ts(row.last_sync_at)?,
        last_sync_commit: row.last_sync_commit,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    module_scm_repo_id: String,
    event_id: Option<String>,
    event_type: String,
    ref_name: Option<String>,
    commit_sha: Option<String>,
    tag_name: Option<String>,
    payload: String,
    headers: String,
    signature: Option<String>,
    signature_valid: i64,
    processed: i64,
    status: String,
    processing_started_at: Option<String>,
    processed_at: Option<String>,
    result_version_id: Option<String>,
    error: Option<String>,
    created_at: String,
}

fn row_to_event(row: EventRow) -> Result<ScmWebhookEvent> {
    Ok(ScmWebhookEvent {
        id: parse_uuid(&row.id)?,
        module_scm_repo_id: parse_uuid(&row.module_scm_repo_id)?,
        event_id: row.event_id,
        event_type: row.event_type,
        ref_name: row.ref_name,
        commit_sha: row.commit_sha,
        tag_name: row.tag_name,
        payload: row.payload,
        headers: row.headers,
        signature: row.signature,
        signature_valid: row.signature_valid != 0,
        processed: row.processed != 0,
        status: row.status,
        processing_started_at: parse_opt_ts(row.processing_started_at)?,
        processed_at: parse_opt_ts(row.processed_at)?,
        result_version_id: parse_opt_uuid(row.result_version_id)?,
        error: row.error,
        created_at: parse_ts(&row.created_at)?,
    })
}

const PROVIDER_COLS: &str = "id, organization_id, provider_type, name, base_url, tenant_id, \
    client_id, client_secret_encrypted, webhook_secret, is_active, created_at, updated_at";
const LINK_COLS: &str = "id, module_id, scm_provider_id, repository_owner, repository_name, \
    default_branch, module_path, tag_pattern, auto_publish, webhook_id, webhook_url, \
    webhook_secret, webhook_enabled, last_sync_at, last_sync_commit, created_at, updated_at";
const EVENT_COLS: &str = "id, module_scm_repo_id, event_id, event_type, ref_name, commit_sha, \
    tag_name, payload, headers, signature, signature_valid, processed, status, \
    processing_started_at, processed_at, result_version_id, error, created_at";

#[derive(Clone, Debug)]
pub struct ScmRepository {
    pool: SqlitePool,
}

impl ScmRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, provider), fields(name = %provider.name))]
    pub async fn create_provider(&self, provider: &NewScmProvider) -> Result<ScmProvider> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO scm_providers (id, organization_id, provider_type, name, base_url, \
             tenant_id, client_id, client_secret_encrypted, webhook_secret, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(provider.organization_id.to_string())
        .bind(&provider.provider_type)
        .bind(&provider.name)
        .bind(&provider.base_url)
        .bind(&provider.tenant_id)
        .bind(&provider.client_id)
        .bind(&provider.client_secret_encrypted)
        .bind(&provider.webhook_secret)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        self.get_provider(id)
            .await?
            .ok_or_else(|| DbError::Internal("scm provider vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_provider(&self, id: Uuid) -> Result<Option<ScmProvider>> {
        let row: Option<ProviderRow> = sqlx::query_as(&format!(
            "SELECT {PROVIDER_COLS} FROM scm_providers WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_provider).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_providers(&self, organization_id: Uuid) -> Result<Vec<ScmProvider>> {
        let rows: Vec<ProviderRow> = sqlx::query_as(&format!(
            "SELECT {PROVIDER_COLS} FROM scm_providers WHERE organization_id = ? ORDER BY name"
        ))
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_provider).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_provider(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM scm_providers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("scm provider not found".to_string()));
        }
        Ok(())
    }

    /// Save a user's OAuth token, replacing any previous token for the same
    /// `(user, provider)` pair.
    #[tracing::instrument(skip(self, access_token_encrypted, refresh_token_encrypted))]
    pub async fn save_user_token(
        &self,
        user_id: Uuid,
        scm_provider_id: Uuid,
        access_token_encrypted: &str,
        refresh_token_encrypted: Option<&str>,
        token_type: &str,
        expires_at: Option<DateTime<Utc>>,
        scopes: Option<&str>,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        sqlx::query(
            "INSERT INTO scm_user_tokens (id, user_id, scm_provider_id, access_token_encrypted, \
             refresh_token_encrypted, token_type, expires_at, scopes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, scm_provider_id) DO UPDATE SET
                 access_token_encrypted = excluded.access_token_encrypted,
                 refresh_token_encrypted = excluded.refresh_token_encrypted,
                 token_type = excluded.token_type,
                 expires_at = excluded.expires_at,
                 scopes = excluded.scopes,
                 updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.to_string())
        .bind(scm_provider_id.to_string())
        .bind(access_token_encrypted)
        .bind(refresh_token_encrypted)
        .bind(token_type)
        .bind(expires_at.map(fmt_ts))
        .bind(scopes)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_user_token(
        &self,
        user_id: Uuid,
        scm_provider_id: Uuid,
    ) -> Result<Option<ScmUserToken>> {
        let row: Option<(
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT id, access_token_encrypted, refresh_token_encrypted, token_type, expires_at, \
             scopes FROM scm_user_tokens WHERE user_id = ? AND scm_provider_id = ?",
        )
        .bind(user_id.to_string())
        .bind(scm_provider_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id, access, refresh, token_type, expires, scopes)| {
            Ok(ScmUserToken {
                id: parse_uuid(&id)?,
                user_id,
                scm_provider_id,
                access_token_encrypted: access,
                refresh_token_encrypted: refresh,
                token_type,
                expires_at: parse_opt_ts(expires)?,
                scopes,
            })
        })
        .transpose()
    }

    #[tracing::instrument(skip(self, link))]
    pub async fn create_repo_link(&self, link: &NewModuleScmRepo) -> Result<ModuleScmRepo> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO module_scm_repos (id, module_id, scm_provider_id, repository_owner, \
             repository_name, default_branch, module_path, tag_pattern, auto_publish, \
             webhook_secret, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(link.module_id.to_string())
        .bind(link.scm_provider_id.to_string())
        .bind(&link.repository_owner)
        .bind(&link.repository_name)
        .bind(&link.default_branch)
        .bind(&link.module_path)
        .bind(&link.tag_pattern)
        .bind(link.auto_publish as i64)
        .bind(&link.webhook_secret)
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::on_conflict(e, "module is already linked to a repository"))?;
        self.get_repo_link(id)
            .await?
            .ok_or_else(|| DbError::Internal("repo link vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_repo_link(&self, id: Uuid) -> Result<Option<ModuleScmRepo>> {
        let row: Option<RepoLinkRow> = sqlx::query_as(&format!(
            "SELECT {LINK_COLS} FROM module_scm_repos WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_repo_link).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_repo_link_by_module(&self, module_id: Uuid) -> Result<Option<ModuleScmRepo>> {
        let row: Option<RepoLinkRow> = sqlx::query_as(&format!(
            "SELECT {LINK_COLS} FROM module_scm_repos WHERE module_id = ?"
        ))
        .bind(module_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_repo_link).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_webhook(
        &self,
        id: Uuid,
        webhook_id: Option<&str>,
        webhook_url: Option<&str>,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE module_scm_repos SET webhook_id = ?, webhook_url = ?, webhook_enabled = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(webhook_id)
        .bind(webhook_url)
        .bind(enabled as i64)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_repo_sync(&self, id: Uuid, commit: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE module_scm_repos SET last_sync_at = ?, last_sync_commit = COALESCE(?, last_sync_commit) \
             WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(commit)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_repo_link(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM module_scm_repos WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("repo link not found".to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn create_webhook_event(&self, event: &NewScmWebhookEvent) -> Result<ScmWebhookEvent> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scm_webhook_events (id, module_scm_repo_id, event_id, event_type, \
             ref_name, commit_sha, tag_name, payload, headers, signature, signature_valid, \
             created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(event.module_scm_repo_id.to_string())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.ref_name)
        .bind(&event.commit_sha)
        .bind(&event.tag_name)
        .bind(&event.payload)
        .bind(&event.headers)
        .bind(&event.signature)
        .bind(event.signature_valid as i64)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        self.get_webhook_event(id)
            .await?
            .ok_or_else(|| DbError::Internal("webhook event vanished after insert".to_string()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_webhook_event(&self, id: Uuid) -> Result<Option<ScmWebhookEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLS} FROM scm_webhook_events WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_event).transpose()
    }

    /// Already-processed event with the same dedup key, if any. The key is
    /// the SCM-provided delivery ID when present, `(commit, tag)` otherwise.
    #[tracing::instrument(skip(self))]
    pub async fn find_processed_duplicate(
        &self,
        module_scm_repo_id: Uuid,
        event_id: Option<&str>,
        commit_sha: Option<&str>,
        tag_name: Option<&str>,
    ) -> Result<Option<ScmWebhookEvent>> {
        let row: Option<EventRow> = match event_id {
            Some(eid) => {
                sqlx::query_as(&format!(
                    "SELECT {EVENT_COLS} FROM scm_webhook_events
                     WHERE module_scm_repo_id = ? AND event_id = ? AND processed = 1
                     LIMIT 1"
                ))
                .bind(module_scm_repo_id.to_string())
                .bind(eid)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {EVENT_COLS} FROM scm_webhook_events
                     WHERE module_scm_repo_id = ? AND commit_sha IS ? AND tag_name IS ?
                       AND processed = 1
                     LIMIT 1"
                ))
                .bind(module_scm_repo_id.to_string())
                .bind(commit_sha)
                .bind(tag_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(row_to_event).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_event_processing(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE scm_webhook_events SET status = 'processing', processing_started_at = ? \
             WHERE id = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Final event state: `completed`, `failed`, or `skipped`.
    #[tracing::instrument(skip(self, error))]
    pub async fn complete_event(
        &self,
        id: Uuid,
        status: &str,
        result_version_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scm_webhook_events SET status = ?, processed = 1, processed_at = ?, \
             result_version_id = ?, error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(fmt_ts(Utc::now()))
        .bind(result_version_id.map(|u| u.to_string()))
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_events(&self, module_scm_repo_id: Uuid, limit: i64) -> Result<Vec<ScmWebhookEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLS} FROM scm_webhook_events
             WHERE module_scm_repo_id = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(module_scm_repo_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Record a tag moving to a different commit. One open alert per
    /// `(version, detected sha)` is enough; duplicates are ignored.
    #[tracing::instrument(skip(self))]
    pub async fn create_tag_alert(
        &self,
        module_version_id: Uuid,
        tag_name: &str,
        original_commit_sha: &str,
        detected_commit_sha: &str,
    ) -> Result<Option<Uuid>> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM tag_immutability_alerts
             WHERE module_version_id = ? AND detected_commit_sha = ? AND resolved = 0",
        )
        .bind(module_version_id.to_string())
        .bind(detected_commit_sha)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(None);
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tag_immutability_alerts (id, module_version_id, tag_name, \
             original_commit_sha, detected_commit_sha, detected_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(module_version_id.to_string())
        .bind(tag_name)
        .bind(original_commit_sha)
        .bind(detected_commit_sha)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(Some(id))
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_open_tag_alerts(&self) -> Result<Vec<TagImmutabilityAlert>> {
        let rows: Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            i64,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT id, module_version_id, tag_name, original_commit_sha, detected_commit_sha, \
             detected_at, alert_sent, resolved, resolved_by, notes
             FROM tag_immutability_alerts WHERE resolved = 0 ORDER BY detected_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(TagImmutabilityAlert {
                    id: parse_uuid(&r.0)?,
                    module_version_id: parse_uuid(&r.1)?,
                    tag_name: r.2,
                    original_commit_sha: r.3,
                    detected_commit_sha: r.4,
                    detected_at: parse_ts(&r.5)?,
                    alert_sent: r.6 != 0,
                    resolved: r.7 != 0,
                    resolved_by: parse_opt_uuid(r.8)?,
                    notes: r.9,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self, notes))]
    pub async fn resolve_tag_alert(
        &self,
        id: Uuid,
        resolved_by: Uuid,
        notes: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tag_immutability_alerts SET resolved = 1, resolved_by = ?, notes = ? WHERE id = ?",
        )
        .bind(resolved_by.to_string())
        .bind(notes)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("tag alert not found".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn seed_link(db: &Database) -> ModuleScmRepo {
        let org = db.organizations().default_org().await.unwrap();
        let module = db
            .modules()
            .upsert_module(org.id, "acme", "vpc", "aws", "", "", None)
            .await
            .unwrap();
        let provider = db
            .scm()
            .create_provider(&NewScmProvider {
                organization_id: org.id,
                provider_type: "github".to_string(),
                name: "GitHub".to_string(),
                base_url: None,
                tenant_id: None,
                client_id: "client".to_string(),
                client_secret_encrypted: None,
                webhook_secret: Some("shh".to_string()),
            })
            .await
            .unwrap();
        db.scm()
            .create_repo_link(&NewModuleScmRepo {
                module_id: module.id,
                scm_provider_id: provider.id,
                repository_owner: "acme".to_string(),
                repository_name: "terraform-aws-vpc".to_string(),
                default_branch: "main".to_string(),
                module_path: String::new(),
                tag_pattern: "v*".to_string(),
                auto_publish: true,
                webhook_secret: "link-secret".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_link_per_module() {
        let db = Database::in_memory().await.unwrap();
        let link = seed_link(&db).await;
        let err = db
            .scm()
            .create_repo_link(&NewModuleScmRepo {
                module_id: link.module_id,
                scm_provider_id: link.scm_provider_id,
                repository_owner: "acme".to_string(),
                repository_name: "other".to_string(),
                default_branch: "main".to_string(),
                module_path: String::new(),
                tag_pattern: "v*".to_string(),
                auto_publish: true,
                webhook_secret: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_event_dedup_by_event_id() {
        let db = Database::in_memory().await.unwrap();
        let link = seed_link(&db).await;
        let event = db
            .scm()
            .create_webhook_event(&NewScmWebhookEvent {
                module_scm_repo_id: link.id,
                event_id: Some("delivery-1".to_string()),
                event_type: "push".to_string(),
                ref_name: Some("refs/tags/v1.0.0".to_string()),
                commit_sha: Some("abc123".to_string()),
                tag_name: Some("v1.0.0".to_string()),
                payload: "{}".to_string(),
                headers: "{}".to_string(),
                signature: None,
                signature_valid: true,
            })
            .await
            .unwrap();

        // Unprocessed events do not dedup.
        assert!(db
            .scm()
            .find_processed_duplicate(link.id, Some("delivery-1"), None, None)
            .await
            .unwrap()
            .is_none());

        db.scm()
            .complete_event(event.id, "completed", None, None)
            .await
            .unwrap();
        let dup = db
            .scm()
            .find_processed_duplicate(link.id, Some("delivery-1"), None, None)
            .await
            .unwrap();
        assert!(dup.is_some());
    }

    #[tokio::test]
    async fn test_user_token_upsert_replaces() {
        let db = Database::in_memory().await.unwrap();
        let link = seed_link(&db).await;
        let user = db
            .users()
            .create(&crate::db::users::NewUser {
                email: "dev@acme.io".to_string(),
                name: "Dev".to_string(),
                oidc_sub: None,
            })
            .await
            .unwrap();

        db.scm()
            .save_user_token(user.id, link.scm_provider_id, "enc-1", None, "bearer", None, None)
            .await
            .unwrap();
        db.scm()
            .save_user_token(user.id, link.scm_provider_id, "enc-2", None, "bearer", None, None)
            .await
            .unwrap();
        let token = db
            .scm()
            .get_user_token(user.id, link.scm_provider_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.access_token_encrypted, "enc-2");
    }
}
