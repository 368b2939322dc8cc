//! Module management: CRUD, direct tarball upload, SCM links, manual sync,
//! webhook event log, and tag immutability alerts.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::modules::NewModuleVersion;
use crate::db::scm::NewModuleScmRepo;
use crate::db::DbError;
use crate::error::ApiError;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateModuleRequest {
    pub namespace: String,
    pub name: String,
    pub system: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateModuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    for part in [&request.namespace, &request.name, &request.system] {
        if part.is_empty() || part.contains('/') {
            return Err(ApiError::validation("invalid module coordinates"));
        }
    }
    let org = state.default_org_id().await?;
    let module = state
        .db
        .modules()
        .upsert_module(
            org,
            &request.namespace,
            &request.name,
            &request.system,
            &request.description,
            &request.source,
            caller.user_id,
        )
        .await?;
    audit(&state, &caller, "module.create", "module", Some(module.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "module": module }))))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let module = state
        .db
        .modules()
        .get_by_id(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("module not found"))?;
    Ok(Json(json!({ "module": module })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    let id = parse_id(&id)?;
    state.db.modules().delete(id).await?;
    audit(&state, &caller, "module.delete", "module", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_versions(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let versions = state.db.modules().list_versions(parse_id(&id)?).await?;
    Ok(Json(json!({ "versions": versions })))
}

/// `POST /api/v1/modules/:namespace/:name/:system/:version`
///
/// Raw `.tar.gz` body. Creates the module on first upload; duplicate
/// versions conflict.
pub async fn upload_version(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path((namespace, name, system, version)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    if !crate::semver::is_valid(&version) {
        return Err(ApiError::validation(format!("invalid version {version:?}")));
    }
    if body.is_empty() {
        return Err(ApiError::validation("empty module archive"));
    }
    // Uploaded archives must at least be gzip.
    if body.len() < 2 || body[0] != 0x1f || body[1] != 0x8b {
        return Err(ApiError::validation("module archive must be a gzip tarball"));
    }

    let org = state.default_org_id().await?;
    let module = state
        .db
        .modules()
        .upsert_module(org, &namespace, &name, &system, "", "", caller.user_id)
        .await?;
    if state
        .db
        .modules()
        .get_version(module.id, &version)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "version {version} already exists"
        )));
    }

    let storage_path = format!("modules/{namespace}/{name}/{system}/{name}-{version}.tar.gz");
    let backend = state.storage.get().await?;
    let info = backend
        .upload(&storage_path, Box::pin(std::io::Cursor::new(body.to_vec())))
        .await?;

    let created = state
        .db
        .modules()
        .create_version(&NewModuleVersion {
            module_id: module.id,
            version: version.clone(),
            storage_path: info.path.clone(),
            storage_backend: backend.name().to_string(),
            size_bytes: info.size as i64,
            checksum: info.sha256.clone(),
            readme: None,
            published_by: caller.user_id,
            commit_sha: None,
            tag_name: None,
            scm_repo_id: None,
        })
        .await;
    let row = match created {
        Ok(row) => row,
        Err(DbError::Conflict(msg)) => return Err(ApiError::conflict(msg)),
        Err(e) => return Err(e.into()),
    };
    crate::observability::metrics::increment_module_publishes();
    audit(&state, &caller, "module.publish", "module_version", Some(row.id)).await;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": row.id,
            "storage_path": row.storage_path,
            "size_bytes": row.size_bytes,
            "checksum": row.checksum,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateScmLinkRequest {
    pub scm_provider_id: String,
    pub repository_owner: String,
    pub repository_name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub module_path: String,
    #[serde(default = "default_tag_pattern")]
    pub tag_pattern: String,
    #[serde(default = "default_true")]
    pub auto_publish: bool,
    /// Create the webhook on the remote repository as well.
    #[serde(default)]
    pub create_webhook: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_tag_pattern() -> String {
    "v*".to_string()
}

fn default_true() -> bool {
    true
}

pub async fn create_scm_link(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<CreateScmLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    let module_id = parse_id(&id)?;
    let module = state
        .db
        .modules()
        .get_by_id(module_id)
        .await?
        .ok_or_else(|| ApiError::not_found("module not found"))?;

    let webhook_secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let link = state
        .db
        .scm()
        .create_repo_link(&NewModuleScmRepo {
            module_id,
            scm_provider_id: parse_id(&request.scm_provider_id)?,
            repository_owner: request.repository_owner,
            repository_name: request.repository_name,
            default_branch: request.default_branch,
            module_path: request.module_path,
            tag_pattern: request.tag_pattern,
            auto_publish: request.auto_publish,
            webhook_secret,
        })
        .await?;

    if request.create_webhook {
        let webhook_url = format!(
            "{}/webhooks/scm/{}/{}",
            state.base_url, link.id, link.webhook_secret
        );
        match register_remote_webhook(&state, &link, module.created_by, &webhook_url).await {
            Ok(remote_id) => {
                state
                    .db
                    .scm()
                    .set_webhook(link.id, Some(&remote_id), Some(&webhook_url), true)
                    .await?;
            }
            Err(error) => {
                tracing::warn!(link_id = %link.id, %error, "remote webhook creation failed");
            }
        }
    }

    audit(&state, &caller, "module.scm_link", "module_scm_repo", Some(link.id)).await;
    let link = state
        .db
        .scm()
        .get_repo_link(link.id)
        .await?
        .ok_or_else(|| ApiError::not_found("link not found"))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "link": link, "webhook_secret": link.webhook_secret })),
    ))
}

async fn register_remote_webhook(
    state: &AppState,
    link: &crate::db::scm::ModuleScmRepo,
    owner_user: Option<uuid::Uuid>,
    webhook_url: &str,
) -> anyhow::Result<String> {
    let (provider, connector) = state.publisher.connector_for(link.scm_provider_id).await?;
    let token = state
        .db
        .scm()
        .get_user_token(
            owner_user.ok_or_else(|| anyhow::anyhow!("module has no owner"))?,
            provider.id,
        )
        .await?
        .ok_or_else(|| anyhow::anyhow!("module owner has no token for this provider"))?;
    let plaintext = state.cipher.open(&token.access_token_encrypted)?;
    // The remote hook signs with the provider-level secret; the link secret
    // only guards the callback path.
    let signing_secret = provider.webhook_secret.clone().unwrap_or_default();
    let remote_id = connector
        .create_webhook(
            &plaintext,
            &link.repository_owner,
            &link.repository_name,
            webhook_url,
            &signing_secret,
        )
        .await?;
    Ok(remote_id)
}

pub async fn get_scm_link(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let link = state
        .db
        .scm()
        .get_repo_link_by_module(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("module has no scm link"))?;
    Ok(Json(json!({ "link": link })))
}

pub async fn delete_scm_link(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    let module_id = parse_id(&id)?;
    let link = state
        .db
        .scm()
        .get_repo_link_by_module(module_id)
        .await?
        .ok_or_else(|| ApiError::not_found("module has no scm link"))?;

    // Best-effort removal of the remote hook.
    if let (Some(webhook_id), Some(module)) = (
        link.webhook_id.clone(),
        state.db.modules().get_by_id(module_id).await?,
    ) {
        if let Ok((provider, connector)) =
            state.publisher.connector_for(link.scm_provider_id).await
        {
            if let Some(user_id) = module.created_by {
                if let Ok(Some(token)) = state.db.scm().get_user_token(user_id, provider.id).await {
                    if let Ok(plaintext) = state.cipher.open(&token.access_token_encrypted) {
                        connector
                            .delete_webhook(
                                &plaintext,
                                &link.repository_owner,
                                &link.repository_name,
                                &webhook_id,
                            )
                            .await
                            .ok();
                    }
                }
            }
        }
    }

    state.db.scm().delete_repo_link(link.id).await?;
    audit(&state, &caller, "module.scm_unlink", "module_scm_repo", Some(link.id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/modules/:id/scm/sync`: publish every matching tag now.
pub async fn sync_scm(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:write")?;
    let summary = state
        .publisher
        .sync_module_tags(parse_id(&id)?)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({ "summary": summary })))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_scm_events(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Query(query): Query<EventQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let link = state
        .db
        .scm()
        .get_repo_link_by_module(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("module has no scm link"))?;
    let events = state.db.scm().list_events(link.id, query.limit).await?;
    Ok(Json(json!({ "events": events })))
}

pub async fn list_tag_alerts(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let alerts = state.db.scm().list_open_tag_alerts().await?;
    Ok(Json(json!({ "alerts": alerts })))
}

#[derive(Debug, Deserialize)]
pub struct ResolveAlertRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn resolve_tag_alert(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<ResolveAlertRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "modules:write")?.clone();
    let user_id = caller
        .user_id
        .ok_or_else(|| ApiError::forbidden("a user identity is required"))?;
    state
        .db
        .scm()
        .resolve_tag_alert(parse_id(&id)?, user_id, request.notes.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
