//! Provider management: CRUD, version publication, platform zip upload.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::providers::{NewProviderPlatform, NewProviderVersion};
use crate::db::DbError;
use crate::error::ApiError;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProviderRequest {
    pub namespace: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "providers:write")?.clone();
    if request.namespace.is_empty() || request.provider_type.is_empty() {
        return Err(ApiError::validation("namespace and type are required"));
    }
    let org = state.default_org_id().await?;
    let provider = state
        .db
        .providers()
        .upsert_provider(
            Some(org),
            &request.namespace,
            &request.provider_type,
            &request.description,
            &request.source,
            caller.user_id,
        )
        .await?;
    audit(&state, &caller, "provider.create", "provider", Some(provider.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "provider": provider }))))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "providers:read")?;
    let provider = state
        .db
        .providers()
        .get_provider_by_id(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("provider not found"))?;
    let versions = state.db.providers().list_versions(provider.id).await?;
    Ok(Json(json!({ "provider": provider, "versions": versions })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "providers:write")?.clone();
    let id = parse_id(&id)?;
    state.db.providers().delete_provider(id).await?;
    audit(&state, &caller, "provider.delete", "provider", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub version: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub gpg_public_key: Option<String>,
    #[serde(default)]
    pub gpg_key_id: Option<String>,
    #[serde(default)]
    pub shasums_url: Option<String>,
    #[serde(default)]
    pub shasums_signature_url: Option<String>,
}

pub async fn create_version(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<CreateVersionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "providers:write")?.clone();
    if !crate::semver::is_valid(&request.version) {
        return Err(ApiError::validation(format!(
            "invalid version {:?}",
            request.version
        )));
    }
    let provider_id = parse_id(&id)?;
    state
        .db
        .providers()
        .get_provider_by_id(provider_id)
        .await?
        .ok_or_else(|| ApiError::not_found("provider not found"))?;

    let version = state
        .db
        .providers()
        .create_version(&NewProviderVersion {
            provider_id,
            version: request.version,
            protocols: request.protocols,
            gpg_public_key: request.gpg_public_key,
            gpg_key_id: request.gpg_key_id,
            shasums_url: request.shasums_url,
            shasums_signature_url: request.shasums_signature_url,
            published_by: caller.user_id,
        })
        .await
        .map_err(|e| match e {
            DbError::Conflict(msg) => ApiError::conflict(msg),
            other => other.into(),
        })?;
    audit(&state, &caller, "provider.version", "provider_version", Some(version.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "version": version }))))
}

#[derive(Debug, Deserialize)]
pub struct DeprecateRequest {
    #[serde(default)]
    pub message: Option<String>,
}

pub async fn deprecate_version(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<DeprecateRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "providers:write")?;
    state
        .db
        .providers()
        .deprecate_version(parse_id(&id)?, request.message.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/providers/:namespace/:type/:version/platforms/:os/:arch`
///
/// Raw zip body; the checksum is computed in-stream during upload.
pub async fn upload_platform(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path((namespace, provider_type, version, os, arch)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "providers:write")?.clone();
    if body.is_empty() {
        return Err(ApiError::validation("empty platform archive"));
    }

    let org = state.default_org_id().await?;
    let provider = state
        .db
        .providers()
        .resolve_provider(org, &namespace, &provider_type)
        .await?
        .ok_or_else(|| ApiError::not_found("provider not found"))?;
    let provider_version = state
        .db
        .providers()
        .get_version(provider.id, &version)
        .await?
        .ok_or_else(|| ApiError::not_found("provider version not found"))?;

    let filename = format!("terraform-provider-{provider_type}_{version}_{os}_{arch}.zip");
    let storage_path = format!("providers/{namespace}/{provider_type}/{version}/{filename}");
    let backend = state.storage.get().await?;
    let info = backend
        .upload(&storage_path, Box::pin(std::io::Cursor::new(body.to_vec())))
        .await?;

    let platform = state
        .db
        .providers()
        .create_platform(&NewProviderPlatform {
            provider_version_id: provider_version.id,
            os,
            arch,
            filename,
            storage_path,
            storage_backend: backend.name().to_string(),
            size_bytes: info.size as i64,
            shasum: info.sha256,
        })
        .await
        .map_err(|e| match e {
            DbError::Conflict(msg) => ApiError::conflict(msg),
            other => other.into(),
        })?;
    audit(&state, &caller, "provider.platform", "provider_platform", Some(platform.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "platform": platform }))))
}
