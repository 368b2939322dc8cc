//! Provider Registry Protocol v1.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;

use crate::constants::SIGNED_URL_TTL_SECS;
use crate::error::ApiError;

use super::AppState;

/// `GET /v1/providers/:namespace/:type/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path((namespace, provider_type)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org = state.default_org_id().await?;
    let provider = state
        .db
        .providers()
        .resolve_provider(org, &namespace, &provider_type)
        .await?
        .ok_or_else(|| ApiError::not_found("provider not found"))?;
    let versions = state.db.providers().list_versions(provider.id).await?;

    let mut entries = Vec::with_capacity(versions.len());
    for version in &versions {
        let platforms = state.db.providers().list_platforms(version.id).await?;
        entries.push(json!({
            "version": version.version,
            "protocols": version.protocols,
            "platforms": platforms
                .iter()
                .map(|p| json!({ "os": p.os, "arch": p.arch }))
                .collect::<Vec<_>>(),
        }));
    }
    Ok(Json(json!({ "versions": entries })))
}

/// `GET /v1/providers/:namespace/:type/:version/download/:os/:arch`
pub async fn download(
    State(state): State<AppState>,
    Path((namespace, provider_type, version, os, arch)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Result<Json<serde_json::Value>, ApiError> {
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
    let platform = state
        .db
        .providers()
        .get_platform(provider_version.id, &os, &arch)
        .await?
        .ok_or_else(|| ApiError::not_found("platform not found"))?;

    let backend = state.storage.get().await?;
    let download_url = backend
        .get_url(
            &platform.storage_path,
            Duration::from_secs(SIGNED_URL_TTL_SECS),
        )
        .await?;

    crate::observability::metrics::increment_provider_downloads();
    let db = state.db.clone();
    let platform_id = platform.id;
    tokio::spawn(async move {
        db.providers()
            .increment_download_count(platform_id)
            .await
            .ok();
    });

    let gpg_keys = match (&provider_version.gpg_key_id, &provider_version.gpg_public_key) {
        (_, None) => Vec::new(),
        (key_id, Some(armor)) => vec![json!({
            "key_id": key_id.clone().unwrap_or_default(),
            "ascii_armor": armor,
        })],
    };

    Ok(Json(json!({
        "protocols": provider_version.protocols,
        "os": platform.os,
        "arch": platform.arch,
        "filename": platform.filename,
        "download_url": download_url,
        "shasums_url": provider_version.shasums_url,
        "shasums_signature_url": provider_version.shasums_signature_url,
        "shasum": platform.shasum,
        "signing_keys": { "gpg_public_keys": gpg_keys },
    })))
}
