//! Terraform binary mirror management.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::tf_mirrors::NewTerraformMirrorConfig;
use crate::error::ApiError;
use crate::tfmirror::TerraformMirrorWorker;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct TerraformMirrorRequest {
    pub name: String,
    pub tool: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub upstream_url: Option<String>,
    /// List of `os_arch` strings; absent means all platforms.
    #[serde(default)]
    pub platform_filter: Option<Vec<String>>,
    #[serde(default)]
    pub version_filter: Option<String>,
    #[serde(default)]
    pub gpg_verify: bool,
    #[serde(default = "default_true")]
    pub stable_only: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_hours: i64,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> i64 {
    24
}

impl TerraformMirrorRequest {
    fn to_new(&self) -> NewTerraformMirrorConfig {
        NewTerraformMirrorConfig {
            name: self.name.clone(),
            tool: self.tool.clone(),
            enabled: self.enabled,
            upstream_url: self.upstream_url.clone(),
            platform_filter: crate::db::tf_mirrors::encode_platform_filter(
                self.platform_filter.as_deref(),
            ),
            version_filter: self.version_filter.clone(),
            gpg_verify: self.gpg_verify,
            stable_only: self.stable_only,
            sync_interval_hours: self.sync_interval_hours,
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "mirrors:read")?;
    let mirrors = state.db.tf_mirrors().list_configs().await?;
    Ok(Json(json!({ "mirrors": mirrors })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<TerraformMirrorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "mirrors:manage")?.clone();
    if request.tool != "terraform" && request.tool != "opentofu" {
        return Err(ApiError::validation("tool must be terraform or opentofu"));
    }
    if request.sync_interval_hours < 1 {
        return Err(ApiError::validation("sync_interval_hours must be positive"));
    }
    let config = state.db.tf_mirrors().create_config(&request.to_new()).await?;
    audit(&state, &caller, "tfmirror.create", "terraform_mirror", Some(config.id)).await;
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
        .tf_mirrors()
        .get_config(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("terraform mirror not found"))?;
    let versions = state.db.tf_mirrors().list_versions(config.id).await?;
    Ok(Json(json!({ "mirror": config, "versions": versions })))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<TerraformMirrorRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "mirrors:manage")?;
    state
        .db
        .tf_mirrors()
        .update_config(parse_id(&id)?, &request.to_new())
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
    state.db.tf_mirrors().delete_config(id).await?;
    audit(&state, &caller, "tfmirror.delete", "terraform_mirror", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_sync(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_scope(&auth, "mirrors:manage")?;
    let config = state
        .db
        .tf_mirrors()
        .get_config(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("terraform mirror not found"))?;
    if config.last_sync_status.as_deref() == Some("in_progress") {
        return Err(ApiError::conflict("a sync is already running"));
    }

    let worker = TerraformMirrorWorker::new(state.db.clone(), state.storage.clone());
    let config_id = config.id;
    tokio::spawn(async move {
        if let Err(error) = worker.sync_config(config, "manual").await {
            tracing::error!(%config_id, %error, "manual terraform mirror sync failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}
