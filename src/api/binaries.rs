//! Terraform binary mirror protocol (custom).
//!
//! Public, unauthenticated endpoints. Only platforms with
//! `sync_status = 'synced'` are visible.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::constants::SIGNED_URL_TTL_SECS;
use crate::db::tf_mirrors::{TerraformMirrorConfig, TerraformVersion};
use crate::error::ApiError;

use super::AppState;

/// `GET /terraform/binaries`
pub async fn list_configs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let configs = state.db.tf_mirrors().list_configs().await?;
    Ok(Json(json!({
        "binaries": configs
            .iter()
            .map(|c| json!({ "name": c.name, "tool": c.tool, "enabled": c.enabled }))
            .collect::<Vec<_>>(),
    })))
}

async fn config_by_name(state: &AppState, name: &str) -> Result<TerraformMirrorConfig, ApiError> {
    state
        .db
        .tf_mirrors()
        .get_config_by_name(name)
        .await?
        .ok_or_else(|| ApiError::not_found("binary mirror not found"))
}

async fn version_payload(
    state: &AppState,
    version: &TerraformVersion,
) -> Result<serde_json::Value, ApiError> {
    let platforms = state.db.tf_mirrors().list_platforms(version.id).await?;
    Ok(json!({
        "version": version.version,
        "is_latest": version.is_latest,
        "release_date": version.release_date,
        "platforms": platforms
            .iter()
            .filter(|p| p.sync_status == "synced")
            .map(|p| json!({
                "os": p.os,
                "arch": p.arch,
                "filename": p.filename,
                "sha256": p.sha256,
                "size_bytes": p.size_bytes,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// `GET /terraform/binaries/:name/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = config_by_name(&state, &name).await?;
    let versions = state.db.tf_mirrors().list_synced_versions(config.id).await?;
    Ok(Json(json!({
        "versions": versions
            .iter()
            .map(|v| json!({ "version": v.version, "is_latest": v.is_latest }))
            .collect::<Vec<_>>(),
    })))
}

/// `GET /terraform/binaries/:name/versions/latest`
pub async fn latest_version(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = config_by_name(&state, &name).await?;
    let version = state
        .db
        .tf_mirrors()
        .get_latest_version(config.id)
        .await?
        .filter(|v| v.sync_status == "synced")
        .ok_or_else(|| ApiError::not_found("no synced latest version"))?;
    Ok(Json(version_payload(&state, &version).await?))
}

/// `GET /terraform/binaries/:name/versions/:version`
pub async fn get_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = config_by_name(&state, &name).await?;
    let version = state
        .db
        .tf_mirrors()
        .get_version(config.id, &version)
        .await?
        .filter(|v| v.sync_status == "synced")
        .ok_or_else(|| ApiError::not_found("version not found"))?;
    Ok(Json(version_payload(&state, &version).await?))
}

/// `GET /terraform/binaries/:name/versions/:version/:os/:arch`
///
/// 302 to a signed URL for the stored zip.
pub async fn download(
    State(state): State<AppState>,
    Path((name, version, os, arch)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let config = config_by_name(&state, &name).await?;
    let version = state
        .db
        .tf_mirrors()
        .get_version(config.id, &version)
        .await?
        .ok_or_else(|| ApiError::not_found("version not found"))?;
    let platform = state
        .db
        .tf_mirrors()
        .get_platform(version.id, &os, &arch)
        .await?
        .filter(|p| p.sync_status == "synced")
        .ok_or_else(|| ApiError::not_found("platform not found"))?;
    let storage_key = platform
        .storage_key
        .ok_or_else(|| ApiError::not_found("platform has no stored artifact"))?;

    let backend = state.storage.get().await?;
    let url = backend
        .get_url(&storage_key, Duration::from_secs(SIGNED_URL_TTL_SECS))
        .await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}
