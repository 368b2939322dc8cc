//! Provider mirror management: configs, manual sync, history, policies, and
//! approval requests.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::mirrors::{NewMirrorConfig, NewMirrorPolicy};
use crate::error::ApiError;
use crate::mirror::MirrorSyncWorker;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct MirrorConfigRequest {
    pub name: String,
    pub upstream_registry_url: String,
    #[serde(default)]
    pub namespace_filter: Option<String>,
    #[serde(default)]
    pub provider_filter: Option<String>,
    #[serde(default)]
    pub version_filter: Option<String>,
    #[serde(default)]
    pub platform_filter: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_hours: i64,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> i64 {
    24
}

impl MirrorConfigRequest {
    fn to_new(&self, organization_id: Option<uuid::Uuid>) -> NewMirrorConfig {
        NewMirrorConfig {
            name: self.name.clone(),
            upstream_registry_url: self.upstream_registry_url.trim_end_matches('/').to_string(),
            organization_id,
            namespace_filter: self.namespace_filter.clone(),
            provider_filter: self.provider_filter.clone(),
            version_filter: self.version_filter.clone(),
            platform_filter: self.platform_filter.clone(),
            enabled: self.enabled,
            sync_interval_hours: self.sync_interval_hours,
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let mirrors = state.db.mirrors().list_configs().await?;
    Ok(Json(json!({ "mirrors": mirrors })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<MirrorConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    if request.name.is_empty() || !request.upstream_registry_url.starts_with("http") {
        return Err(ApiError::validation(
            "name and a http(s) upstream_registry_url are required",
        ));
    }
    if request.sync_interval_hours < 1 {
        return Err(ApiError::validation("sync_interval_hours must be positive"));
    }
    let config = state
        .db
        .mirrors()
        .create_config(&request.to_new(caller.organization_id))
        .await?;
    audit(&state, &caller, "mirror.create", "mirror_config", Some(config.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "mirror": config }))))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let config = state
        .db
        .mirrors()
        .get_config(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("mirror not found"))?;
    Ok(Json(json!({ "mirror": config })))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<MirrorConfigRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    let id = parse_id(&id)?;
    state
        .db
        .mirrors()
        .update_config(id, &request.to_new(caller.organization_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    let id = parse_id(&id)?;
    state.db.mirrors().delete_config(id).await?;
    audit(&state, &caller, "mirror.delete", "mirror_config", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Run one sync cycle outside the interval loop. The in-progress guard
/// still applies.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_scope(&auth, "mirrors:manage")?;
    let config = state
        .db
        .mirrors()
        .get_config(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("mirror not found"))?;
    if config.last_sync_status.as_deref() == Some("in_progress") {
        return Err(ApiError::conflict("a sync is already running"));
    }

    let worker = MirrorSyncWorker::new(state.db.clone(), state.storage.clone());
    let config_id = config.id;
    tokio::spawn(async move {
        if let Err(error) = worker.sync_config(config, "manual").await {
            tracing::error!(%config_id, %error, "manual mirror sync failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    20
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let history = state
        .db
        .mirrors()
        .list_sync_history(parse_id(&id)?, query.limit)
        .await?;
    Ok(Json(json!({ "history": history })))
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub policy_type: String,
    #[serde(default)]
    pub upstream_registry: Option<String>,
    #[serde(default)]
    pub namespace_pattern: Option<String>,
    #[serde(default)]
    pub provider_pattern: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub requires_approval: bool,
    /// Global policies require admin; org policies attach to the caller.
    #[serde(default)]
    pub global: bool,
}

pub async fn list_policies(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let policies = state.db.mirrors().list_policies().await?;
    Ok(Json(json!({ "policies": policies })))
}

pub async fn create_policy(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<PolicyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    if request.policy_type != "allow" && request.policy_type != "deny" {
        return Err(ApiError::validation("policy_type must be allow or deny"));
    }
    let organization_id = if request.global {
        require_scope(&auth, "admin")?;
        None
    } else {
        caller.organization_id
    };
    let policy = state
        .db
        .mirrors()
        .create_policy(&NewMirrorPolicy {
            organization_id,
            name: request.name,
            description: request.description,
            policy_type: request.policy_type,
            upstream_registry: request.upstream_registry,
            namespace_pattern: request.namespace_pattern,
            provider_pattern: request.provider_pattern,
            priority: request.priority,
            requires_approval: request.requires_approval,
        })
        .await?;
    audit(&state, &caller, "mirror.policy_create", "mirror_policy", Some(policy.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "policy": policy }))))
}

#[derive(Debug, Deserialize)]
pub struct SetPolicyActiveRequest {
    pub is_active: bool,
}

pub async fn set_policy_active(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<SetPolicyActiveRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "mirrors:manage")?;
    state
        .db
        .mirrors()
        .set_policy_active(parse_id(&id)?, request.is_active)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_policy(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "mirrors:manage")?;
    state.db.mirrors().delete_policy(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub mirror_config_id: String,
    pub provider_namespace: String,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mirror_config_id: Option<String>,
}

pub async fn list_approvals(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let config_id = query
        .mirror_config_id
        .as_deref()
        .map(parse_id)
        .transpose()?;
    let approvals = state
        .db
        .mirrors()
        .list_approvals(config_id, query.status.as_deref())
        .await?;
    Ok(Json(json!({ "approvals": approvals })))
}

pub async fn request_approval(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "mirrors:read")?.clone();
    let config_id = parse_id(&request.mirror_config_id)?;
    state
        .db
        .mirrors()
        .get_config(config_id)
        .await?
        .ok_or_else(|| ApiError::not_found("mirror not found"))?;
    let approval = state
        .db
        .mirrors()
        .create_approval(
            config_id,
            caller.organization_id,
            caller.user_id,
            &request.provider_namespace,
            request.provider_name.as_deref(),
            request.reason.as_deref(),
            false,
            request.expires_at,
        )
        .await?;
    audit(&state, &caller, "mirror.approval_request", "mirror_approval", Some(approval.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "approval": approval }))))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    /// `approved` or `denied`.
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn review_approval(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    if request.status != "approved" && request.status != "denied" {
        return Err(ApiError::validation("status must be approved or denied"));
    }
    let reviewer = caller
        .user_id
        .ok_or_else(|| ApiError::forbidden("a user identity is required to review"))?;
    state
        .db
        .mirrors()
        .review_approval(parse_id(&id)?, &request.status, reviewer, request.notes.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
