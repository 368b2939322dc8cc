//! Setup-wizard state, storage configurations, and OIDC configurations.
//!
//! Activation uses the single-flight transactions in the settings
//! repository, and storage activation invalidates the lazy backend handle so
//! the new config takes effect without a restart.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::error::ApiError;

use super::{audit, parse_id};
use crate::api::AppState;

/// `GET /api/v1/setup/status`: intentionally unauthenticated-friendly
/// booleans only; the wizard needs them before any identity exists.
pub async fn setup_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = state.db.settings().get_system_settings().await?;
    Ok(Json(json!({
        "storage_configured": settings.storage_configured,
        "oidc_configured": settings.oidc_configured,
        "setup_completed": settings.setup_completed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateStorageConfigRequest {
    pub backend_type: String,
    /// Backend-specific settings; fields named `*_encrypted` hold plaintext
    /// here and are sealed before persisting.
    pub settings: serde_json::Value,
}

pub async fn list_storage_configs(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let configs = state.db.settings().list_storage_configs().await?;
    Ok(Json(json!({
        "configs": configs
            .iter()
            .map(|c| json!({
                "id": c.id,
                "backend_type": c.backend_type,
                "is_active": c.is_active,
                "created_at": c.created_at,
            }))
            .collect::<Vec<_>>(),
    })))
}

/// Seal every `*_encrypted` field of a settings blob in place.
fn seal_secrets(
    state: &AppState,
    mut settings: serde_json::Value,
) -> Result<serde_json::Value, ApiError> {
    if let Some(map) = settings.as_object_mut() {
        for (key, value) in map.iter_mut() {
            if key.ends_with("_encrypted") {
                if let Some(plaintext) = value.as_str() {
                    if !plaintext.is_empty() {
                        let sealed = state
                            .cipher
                            .seal(plaintext)
                            .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
                        *value = json!(sealed);
                    }
                }
            }
        }
    }
    Ok(settings)
}

pub async fn create_storage_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateStorageConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    if !matches!(request.backend_type.as_str(), "local" | "s3" | "azure" | "gcs") {
        return Err(ApiError::validation(format!(
            "unknown backend_type {:?}",
            request.backend_type
        )));
    }
    let sealed = seal_secrets(&state, request.settings)?;
    let config = state
        .db
        .settings()
        .create_storage_config(&request.backend_type, &sealed.to_string())
        .await?;
    audit(&state, &caller, "storage_config.create", "storage_config", Some(config.id)).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": config.id,
            "backend_type": config.backend_type,
            "is_active": config.is_active,
        })),
    ))
}

pub async fn activate_storage_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state.db.settings().activate_storage_config(id).await?;
    state.storage.invalidate().await;
    state
        .db
        .settings()
        .mark_storage_configured(caller.email.as_deref())
        .await?;
    audit(&state, &caller, "storage_config.activate", "storage_config", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_storage_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    state.db.settings().delete_storage_config(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateOidcConfigRequest {
    pub name: String,
    #[serde(default = "default_provider_type")]
    pub provider_type: String,
    pub issuer_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub extra_config: Option<serde_json::Value>,
}

fn default_provider_type() -> String {
    "generic".to_string()
}

pub async fn list_oidc_configs(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let configs = state.db.settings().list_oidc_configs().await?;
    Ok(Json(json!({
        "configs": configs
            .iter()
            .map(|c| json!({
                "id": c.id,
                "name": c.name,
                "issuer_url": c.issuer_url,
                "client_id": c.client_id,
                "has_secret": c.client_secret_encrypted.is_some(),
                "is_active": c.is_active,
            }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn create_oidc_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateOidcConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    if !request.issuer_url.starts_with("http") {
        return Err(ApiError::validation("issuer_url must be a http(s) URL"));
    }
    let client_secret_encrypted = request
        .client_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| state.cipher.seal(s))
        .transpose()
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;

    let config = state
        .db
        .settings()
        .create_oidc_config(
            &request.name,
            &request.provider_type,
            request.issuer_url.trim_end_matches('/'),
            &request.client_id,
            client_secret_encrypted.as_deref(),
            request.redirect_url.as_deref(),
            &serde_json::to_string(&request.scopes).unwrap_or_else(|_| "[]".to_string()),
            request.extra_config.map(|v| v.to_string()).as_deref(),
        )
        .await?;
    audit(&state, &caller, "oidc_config.create", "oidc_config", Some(config.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "id": config.id, "name": config.name }))))
}

pub async fn activate_oidc_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state.db.settings().activate_oidc_config(id).await?;
    state.db.settings().mark_oidc_configured().await?;
    audit(&state, &caller, "oidc_config.activate", "oidc_config", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_oidc_config(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    state.db.settings().delete_oidc_config(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
