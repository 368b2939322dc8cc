//! Search endpoints backed by the with-stats repository queries, plus the
//! audit log listing.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::error::ApiError;

use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    25
}

impl SearchQuery {
    fn clamp(&self) -> (i64, i64) {
        (self.limit.clamp(1, 100), self.offset.max(0))
    }
}

/// `GET /api/v1/search/modules?q=&limit=&offset=`
pub async fn modules(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "modules:read")?;
    let org = state.default_org_id().await?;
    let (limit, offset) = query.clamp();
    let hits = state
        .db
        .modules()
        .search_with_stats(org, &query.q, limit, offset)
        .await?;
    Ok(Json(json!({ "modules": hits })))
}

/// `GET /api/v1/search/providers?q=&limit=&offset=`
pub async fn providers(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "providers:read")?;
    let org = state.default_org_id().await?;
    let (limit, offset) = query.clamp();
    let hits = state
        .db
        .providers()
        .search_with_stats(Some(org), &query.q, limit, offset)
        .await?;
    Ok(Json(json!({ "providers": hits })))
}

/// `GET /api/v1/audit?limit=&offset=`
pub async fn audit_log(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let (limit, offset) = query.clamp();
    let entries = state.db.audit().list(limit, offset).await?;
    Ok(Json(json!({ "entries": entries })))
}
