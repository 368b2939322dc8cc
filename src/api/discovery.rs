//! Terraform service discovery document.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::AppState;

/// `GET /.well-known/terraform.json`
pub async fn service_discovery(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "modules.v1": format!("{}/v1/modules/", state.base_url),
        "providers.v1": format!("{}/v1/providers/", state.base_url),
    }))
}
