//! Provider Network Mirror Protocol v1.
//!
//! Terraform's network-mirror client rejects unknown content-type
//! parameters, so these routes write raw bytes with exactly
//! `Content-Type: application/json` and bypass the framework's
//! charset-appending conveniences.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::json;

use crate::constants::SIGNED_URL_TTL_SECS;
use crate::error::ApiError;

use super::AppState;

/// Raw JSON response without a charset parameter.
fn mirror_json(value: &serde_json::Value) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// `GET /terraform/providers/:hostname/:namespace/:type/index.json`
///
/// The hostname segment is ignored in single-tenant mode.
pub async fn index(
    State(state): State<AppState>,
    Path((_hostname, namespace, provider_type)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let org = state.default_org_id().await?;
    let provider = state
        .db
        .providers()
        .resolve_provider(org, &namespace, &provider_type)
        .await?
        .ok_or_else(|| ApiError::not_found("provider not found"))?;
    let versions = state.db.providers().list_versions(provider.id).await?;

    let mut map = serde_json::Map::new();
    for version in versions {
        map.insert(version.version, json!({}));
    }
    Ok(mirror_json(&json!({ "versions": map })))
}

/// `GET /terraform/providers/:hostname/:namespace/:type/:version.json`
pub async fn archives(
    State(state): State<AppState>,
    Path((_hostname, namespace, provider_type, version_json)): Path<(
        String,
        String,
        String,
        String,
    )>,
) -> Result<Response, ApiError> {
    let version = version_json
        .strip_suffix(".json")
        .ok_or_else(|| ApiError::not_found("unknown mirror document"))?;
    if !crate::semver::is_valid(version) {
        return Err(ApiError::validation(format!("invalid version {version:?}")));
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
        .get_version(provider.id, version)
        .await?
        .ok_or_else(|| ApiError::not_found("provider version not found"))?;
    let platforms = state
        .db
        .providers()
        .list_platforms(provider_version.id)
        .await?;

    let backend = state.storage.get().await?;
    let mut archives = serde_json::Map::new();
    for platform in platforms {
        let url = backend
            .get_url(
                &platform.storage_path,
                Duration::from_secs(SIGNED_URL_TTL_SECS),
            )
            .await?;
        let hash = h1_hash(&platform.shasum)
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("stored shasum is not valid hex")))?;
        archives.insert(
            format!("{}_{}", platform.os, platform.arch),
            json!({ "url": url, "hashes": [hash] }),
        );
    }
    Ok(mirror_json(&json!({ "archives": archives })))
}

/// Terraform's `h1:` content addressing: base64 of the raw SHA-256 bytes.
pub fn h1_hash(hex_shasum: &str) -> Option<String> {
    let raw = hex::decode(hex_shasum).ok()?;
    if raw.len() != 32 {
        return None;
    }
    Some(format!("h1:{}", BASE64.encode(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h1_hash_roundtrip() {
        let raw = [7u8; 32];
        let hash = h1_hash(&hex::encode(raw)).unwrap();
        let decoded = BASE64.decode(hash.strip_prefix("h1:").unwrap()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_h1_hash_rejects_bad_input() {
        assert!(h1_hash("not-hex").is_none());
        assert!(h1_hash("abcd").is_none());
    }
}
