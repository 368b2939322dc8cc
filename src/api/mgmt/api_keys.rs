//! API key management.
//!
//! The plaintext key appears exactly once, in the create and rotate
//! responses; every other read exposes only the prefix and metadata.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{apikey, require_scope, MaybeAuth};
use crate::db::api_keys::{ApiKey, NewApiKey};
use crate::error::ApiError;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn key_json(key: &ApiKey) -> serde_json::Value {
    json!({
        "id": key.id,
        "name": key.name,
        "key_prefix": key.key_prefix,
        "scopes": key.scopes,
        "expires_at": key.expires_at,
        "last_used_at": key.last_used_at,
        "created_at": key.created_at,
    })
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "apikeys:write")?.clone();
    if request.name.is_empty() {
        return Err(ApiError::validation("key name is required"));
    }
    // A key can only carry scopes its creator holds.
    for scope in &request.scopes {
        if !crate::auth::scopes::has_scope(&caller.scopes, scope) {
            return Err(ApiError::forbidden(format!(
                "cannot grant scope {scope:?} you do not hold"
            )));
        }
    }

    let org = caller
        .organization_id
        .ok_or_else(|| ApiError::forbidden("caller has no organization"))?;
    let generated = apikey::generate_key().map_err(ApiError::Internal)?;
    let key = state
        .db
        .api_keys()
        .create_key(&NewApiKey {
            user_id: caller.user_id,
            organization_id: org,
            name: request.name,
            key_hash: generated.hash,
            key_prefix: generated.prefix,
            scopes: request.scopes,
            expires_at: request.expires_at,
        })
        .await?;
    audit(&state, &caller, "apikey.create", "api_key", Some(key.id)).await;

    let mut body = key_json(&key);
    // The only moment the plaintext exists outside the hash.
    body["key"] = json!(generated.plaintext);
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = require_scope(&auth, "apikeys:read")?;
    let user_id = caller
        .user_id
        .ok_or_else(|| ApiError::forbidden("api keys are listed per user"))?;
    let keys = state.db.api_keys().list_by_user(user_id).await?;
    Ok(Json(json!({
        "api_keys": keys.iter().map(key_json).collect::<Vec<_>>(),
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "apikeys:read")?;
    let key = state
        .db
        .api_keys()
        .get_by_id(parse_id(&id)?)
        .await?
        .ok_or_else(|| ApiError::not_found("api key not found"))?;
    Ok(Json(key_json(&key)))
}

pub async fn revoke(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "apikeys:write")?.clone();
    let id = parse_id(&id)?;
    state.db.api_keys().delete(id).await?;
    audit(&state, &caller, "apikey.revoke", "api_key", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Issue a fresh plaintext for an existing key; scopes and expiry survive.
pub async fn rotate(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = require_scope(&auth, "apikeys:write")?.clone();
    let id = parse_id(&id)?;
    let generated = apikey::generate_key().map_err(ApiError::Internal)?;
    state
        .db
        .api_keys()
        .rotate(id, &generated.hash, &generated.prefix)
        .await?;
    audit(&state, &caller, "apikey.rotate", "api_key", Some(id)).await;

    let key = state
        .db
        .api_keys()
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("api key not found"))?;
    let mut body = key_json(&key);
    body["key"] = json!(generated.plaintext);
    Ok(Json(body))
}
