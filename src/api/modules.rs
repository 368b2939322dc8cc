//! Module Registry Protocol v1.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::constants::SIGNED_URL_TTL_SECS;
use crate::error::ApiError;

use super::AppState;

/// `GET /v1/modules/:namespace/:name/:system/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path((namespace, name, system)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org = state.default_org_id().await?;
    let module = state
        .db
        .modules()
        .get_module(org, &namespace, &name, &system)
        .await?
        .ok_or_else(|| ApiError::not_found("module not found"))?;
    let versions = state.db.modules().list_versions(module.id).await?;

    Ok(Json(json!({
        "modules": [{
            "versions": versions
                .iter()
                .map(|v| json!({ "version": v.version }))
                .collect::<Vec<_>>(),
        }]
    })))
}

/// `GET /v1/modules/:namespace/:name/:system/:version/download`
///
/// 204 with the signed URL in `X-Terraform-Get`, per the protocol.
pub async fn download(
    State(state): State<AppState>,
    Path((namespace, name, system, version)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let org = state.default_org_id().await?;
    let module = state
        .db
        .modules()
        .get_module(org, &namespace, &name, &system)
        .await?
        .ok_or_else(|| ApiError::not_found("module not found"))?;
    let module_version = state
        .db
        .modules()
        .get_version(module.id, &version)
        .await?
        .ok_or_else(|| ApiError::not_found("module version not found"))?;

    let backend = state.storage.get().await?;
    let url = backend
        .get_url(
            &module_version.storage_path,
            Duration::from_secs(SIGNED_URL_TTL_SECS),
        )
        .await?;

    crate::observability::metrics::increment_module_downloads();
    let db = state.db.clone();
    let version_id = module_version.id;
    tokio::spawn(async move {
        db.modules().increment_download_count(version_id).await.ok();
    });

    Ok((
        StatusCode::NO_CONTENT,
        [("X-Terraform-Get", url)],
    )
        .into_response())
}
