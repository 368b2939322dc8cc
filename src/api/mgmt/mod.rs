//! Management API (`/api/v1/...`).
//!
//! Authenticated via bearer JWT or API key; every handler gates on a scope
//! through [`crate::auth::require_scope`]. Responses here are regular
//! `application/json; charset=utf-8`; only the network-mirror routes forbid
//! the charset parameter.

pub mod accounts;
pub mod api_keys;
pub mod mirrors;
pub mod modules;
pub mod providers;
pub mod scm_providers;
pub mod search;
pub mod settings;
pub mod tf_mirrors;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::constants::MAX_MODULE_UPLOAD_BYTES;

use super::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    let uploads = Router::new()
        .route(
            "/modules/{namespace}/{name}/{system}/{version}",
            post(modules::upload_version),
        )
        .route(
            "/providers/{namespace}/{provider_type}/{version}/platforms/{os}/{arch}",
            post(providers::upload_platform),
        )
        .layer(DefaultBodyLimit::max(MAX_MODULE_UPLOAD_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            super::rate_limit_upload,
        ));

    Router::new()
        // Accounts
        .route("/users", get(accounts::list_users).post(accounts::create_user))
        .route(
            "/users/{id}",
            get(accounts::get_user)
                .put(accounts::update_user)
                .delete(accounts::delete_user),
        )
        .route(
            "/organizations",
            get(accounts::list_organizations).post(accounts::create_organization),
        )
        .route(
            "/organizations/{id}",
            put(accounts::update_organization).delete(accounts::delete_organization),
        )
        .route(
            "/organizations/{id}/members",
            get(accounts::list_members).post(accounts::add_member),
        )
        .route(
            "/organizations/{id}/members/{user_id}",
            delete(accounts::remove_member),
        )
        .route("/roles", get(accounts::list_roles).post(accounts::create_role))
        .route(
            "/roles/{id}",
            put(accounts::update_role).delete(accounts::delete_role),
        )
        // API keys
        .route("/apikeys", get(api_keys::list).post(api_keys::create))
        .route("/apikeys/{id}", get(api_keys::get).delete(api_keys::revoke))
        .route("/apikeys/{id}/rotate", post(api_keys::rotate))
        // Modules
        .route("/modules", post(modules::create))
        .route(
            "/modules/{id}",
            get(modules::get).delete(modules::delete),
        )
        .route("/modules/{id}/versions", get(modules::list_versions))
        .route(
            "/modules/{id}/scm",
            get(modules::get_scm_link)
                .post(modules::create_scm_link)
                .delete(modules::delete_scm_link),
        )
        .route("/modules/{id}/scm/sync", post(modules::sync_scm))
        .route("/modules/{id}/scm/events", get(modules::list_scm_events))
        .route("/tag-alerts", get(modules::list_tag_alerts))
        .route("/tag-alerts/{id}/resolve", post(modules::resolve_tag_alert))
        // Providers
        .route("/providers", post(providers::create))
        .route("/providers/{id}", get(providers::get).delete(providers::delete))
        .route("/providers/{id}/versions", post(providers::create_version))
        .route(
            "/provider-versions/{id}/deprecate",
            post(providers::deprecate_version),
        )
        // Provider mirrors, policies, approvals
        .route("/mirrors", get(mirrors::list).post(mirrors::create))
        .route(
            "/mirrors/{id}",
            get(mirrors::get).put(mirrors::update).delete(mirrors::delete),
        )
        .route("/mirrors/{id}/sync", post(mirrors::trigger_sync))
        .route("/mirrors/{id}/history", get(mirrors::history))
        .route(
            "/mirror-policies",
            get(mirrors::list_policies).post(mirrors::create_policy),
        )
        .route(
            "/mirror-policies/{id}",
            put(mirrors::set_policy_active).delete(mirrors::delete_policy),
        )
        .route(
            "/mirror-approvals",
            get(mirrors::list_approvals).post(mirrors::request_approval),
        )
        .route("/mirror-approvals/{id}/review", post(mirrors::review_approval))
        // Binary mirrors
        .route(
            "/terraform-mirrors",
            get(tf_mirrors::list).post(tf_mirrors::create),
        )
        .route(
            "/terraform-mirrors/{id}",
            get(tf_mirrors::get)
                .put(tf_mirrors::update)
                .delete(tf_mirrors::delete),
        )
        .route("/terraform-mirrors/{id}/sync", post(tf_mirrors::trigger_sync))
        // SCM providers
        .route(
            "/scm-providers",
            get(scm_providers::list).post(scm_providers::create),
        )
        .route("/scm-providers/{id}", delete(scm_providers::delete))
        // Setup wizard & configs
        .route("/setup/status", get(settings::setup_status))
        .route(
            "/storage-configs",
            get(settings::list_storage_configs).post(settings::create_storage_config),
        )
        .route(
            "/storage-configs/{id}",
            delete(settings::delete_storage_config),
        )
        .route(
            "/storage-configs/{id}/activate",
            post(settings::activate_storage_config),
        )
        .route(
            "/oidc-configs",
            get(settings::list_oidc_configs).post(settings::create_oidc_config),
        )
        .route("/oidc-configs/{id}", delete(settings::delete_oidc_config))
        .route(
            "/oidc-configs/{id}/activate",
            post(settings::activate_oidc_config),
        )
        // Search & audit
        .route("/search/modules", get(search::modules))
        .route("/search/providers", get(search::providers))
        .route("/audit", get(search::audit_log))
        .merge(uploads)
        .layer(middleware::from_fn_with_state(
            state,
            super::rate_limit_api,
        ))
}

/// Best-effort audit trail entry for a management mutation.
pub(crate) async fn audit(
    state: &AppState,
    auth: &AuthContext,
    action: &str,
    resource_type: &str,
    resource_id: Option<Uuid>,
) {
    state
        .db
        .audit()
        .record(
            auth.organization_id,
            auth.user_id,
            action,
            resource_type,
            resource_id.map(|id| id.to_string()).as_deref(),
            None,
        )
        .await
        .ok();
}

/// Parse a path id, mapping garbage to 404 rather than 400 so probes cannot
/// distinguish malformed from missing.
pub(crate) fn parse_id(raw: &str) -> Result<Uuid, crate::error::ApiError> {
    Uuid::parse_str(raw).map_err(|_| crate::error::ApiError::not_found("resource not found"))
}
