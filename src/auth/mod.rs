//! # Authentication & Authorization
//!
//! Three paths produce an authenticated context: a bearer JWT from the
//! configured OIDC provider, a registry API key, or the dev-mode
//! impersonation header (only when the process runs with `dev_mode`).
//!
//! The optional-auth middleware never rejects a request; it attaches
//! [`MaybeAuth`] and lets each handler decide with [`require_scope`].

pub mod apikey;
pub mod jwt;
pub mod policy;
pub mod scopes;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ApiError;

/// Who is calling, and with what capabilities.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub email: Option<String>,
    pub scopes: Vec<String>,
}

/// Result of the optional-auth middleware, present on every request.
#[derive(Debug, Clone, Default)]
pub struct MaybeAuth(pub Option<AuthContext>);

/// Populate [`MaybeAuth`] from credentials when they are valid; never 401s.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth = authenticate(&state, request.headers()).await;
    request.extensions_mut().insert(MaybeAuth(auth));
    next.run(request).await
}

/// Scope gate used by management handlers.
pub fn require_scope<'a>(auth: &'a MaybeAuth, scope: &str) -> Result<&'a AuthContext, ApiError> {
    let context = auth
        .0
        .as_ref()
        .ok_or_else(|| ApiError::unauthenticated("authentication required"))?;
    if !scopes::has_scope(&context.scopes, scope) {
        return Err(ApiError::forbidden(format!("scope {scope:?} required")));
    }
    Ok(context)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<AuthContext> {
    if state.dev_mode {
        if let Some(email) = headers.get("x-dev-impersonate").and_then(|v| v.to_str().ok()) {
            return dev_impersonate(state, email).await;
        }
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))?;

    if apikey::looks_like_api_key(token) {
        let key = apikey::authenticate(&state.db, token).await?;
        return Some(AuthContext {
            user_id: key.user_id,
            api_key_id: Some(key.id),
            organization_id: Some(key.organization_id),
            email: None,
            scopes: key.scopes,
        });
    }

    let config = state.db.settings().get_active_oidc_config().await.ok()??;
    let claims = match state.jwt.verify(token, &config).await {
        Ok(claims) => claims,
        Err(error) => {
            tracing::debug!(%error, "jwt verification failed");
            return None;
        }
    };
    let email = claims.email.clone()?;
    let name = claims
        .name
        .clone()
        .or(claims.preferred_username.clone())
        .unwrap_or_else(|| email.clone());
    let user = state
        .db
        .users()
        .find_or_create_oidc_user(&claims.sub, &email, &name)
        .await
        .ok()?;
    let scopes = state.db.users().effective_scopes(user.id).await.ok()?;
    let org = state.db.organizations().default_org().await.ok()?;
    Some(AuthContext {
        user_id: Some(user.id),
        api_key_id: None,
        organization_id: Some(org.id),
        email: Some(email),
        scopes,
    })
}

async fn dev_impersonate(state: &AppState, email: &str) -> Option<AuthContext> {
    let user = state
        .db
        .users()
        .get_user_by_email(email)
        .await
        .ok()
        .flatten()?;
    let org = state.db.organizations().default_org().await.ok()?;
    tracing::warn!(%email, "dev-mode impersonation in use");
    Some(AuthContext {
        user_id: Some(user.id),
        api_key_id: None,
        organization_id: Some(org.id),
        email: Some(email.to_string()),
        scopes: vec!["admin".to_string()],
    })
}
