//! SCM provider management.
//!
//! Client secrets are sealed before they touch the database and never
//! returned; responses expose `has_secret` instead.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::scm::{NewScmProvider, ScmProvider};
use crate::error::ApiError;
use crate::scm::ScmProviderType;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateScmProviderRequest {
    pub provider_type: String,
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn provider_json(provider: &ScmProvider) -> serde_json::Value {
    json!({
        "id": provider.id,
        "provider_type": provider.provider_type,
        "name": provider.name,
        "base_url": provider.base_url,
        "tenant_id": provider.tenant_id,
        "client_id": provider.client_id,
        "has_secret": provider.client_secret_encrypted.is_some(),
        "is_active": provider.is_active,
        "created_at": provider.created_at,
    })
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = require_scope(&auth, "admin")?;
    let org = caller
        .organization_id
        .ok_or_else(|| ApiError::forbidden("caller has no organization"))?;
    let providers = state.db.scm().list_providers(org).await?;
    Ok(Json(json!({
        "providers": providers.iter().map(provider_json).collect::<Vec<_>>(),
    })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateScmProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    if ScmProviderType::parse(&request.provider_type).is_none() {
        return Err(ApiError::validation(format!(
            "unknown provider_type {:?}",
            request.provider_type
        )));
    }
    let org = caller
        .organization_id
        .ok_or_else(|| ApiError::forbidden("caller has no organization"))?;

    let client_secret_encrypted = request
        .client_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| state.cipher.seal(s))
        .transpose()
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;

    let provider = state
        .db
        .scm()
        .create_provider(&NewScmProvider {
            organization_id: org,
            provider_type: request.provider_type,
            name: request.name,
            base_url: request.base_url,
            tenant_id: request.tenant_id,
            client_id: request.client_id,
            client_secret_encrypted,
            webhook_secret: request.webhook_secret,
        })
        .await?;
    audit(&state, &caller, "scm_provider.create", "scm_provider", Some(provider.id)).await;
    Ok((StatusCode::CREATED, Json(provider_json(&provider))))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state.db.scm().delete_provider(id).await?;
    audit(&state, &caller, "scm_provider.delete", "scm_provider", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}
