//! # HTTP API
//!
//! Router assembly for the protocol endpoints (unauthenticated,
//! Terraform-shaped), the management API, the webhook receiver, the file
//! proxy, and the health/metrics endpoints.

pub mod binaries;
pub mod discovery;
pub mod files;
pub mod mgmt;
pub mod modules;
pub mod netmirror;
pub mod providers;
pub mod webhooks;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::jwt::JwtVerifier;
use crate::config::BootstrapConfig;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::ApiError;
use crate::publisher::Publisher;
use crate::ratelimit::{RateLimiter, RouteClass};
use crate::scm::ConnectorRegistry;
use crate::storage::signer::UrlSigner;
use crate::storage::{BackendRegistry, LazyStorage};

/// Everything handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub cipher: TokenCipher,
    pub storage: Arc<LazyStorage>,
    pub signer: UrlSigner,
    pub connectors: &'static ConnectorRegistry,
    pub publisher: Arc<Publisher>,
    pub limiter: Arc<RateLimiter>,
    pub jwt: Arc<JwtVerifier>,
    pub base_url: String,
    pub trust_proxy_headers: bool,
    pub dev_mode: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(db: Database, cipher: TokenCipher, config: &BootstrapConfig) -> Self {
        let base_url = config.external_base_url();
        let signer = UrlSigner::new(*cipher.signing_key(), base_url.clone());
        let storage = Arc::new(LazyStorage::new(
            db.clone(),
            BackendRegistry::global(),
            cipher.clone(),
            signer.clone(),
        ));
        let connectors = ConnectorRegistry::global();
        let publisher = Arc::new(Publisher::new(
            db.clone(),
            Arc::clone(&storage),
            connectors,
            cipher.clone(),
        ));
        Self {
            db,
            cipher,
            storage,
            signer,
            connectors,
            publisher,
            limiter: Arc::new(RateLimiter::new()),
            jwt: Arc::new(JwtVerifier::new()),
            base_url,
            trust_proxy_headers: config.trust_proxy_headers,
            dev_mode: config.dev_mode,
        }
    }

    /// The synthetic single-tenant organization.
    pub async fn default_org_id(&self) -> Result<Uuid, ApiError> {
        Ok(self.db.organizations().default_org().await?.id)
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let protocol = Router::new()
        .route("/.well-known/terraform.json", get(discovery::service_discovery))
        .route(
            "/v1/modules/{namespace}/{name}/{system}/versions",
            get(modules::list_versions),
        )
        .route(
            "/v1/modules/{namespace}/{name}/{system}/{version}/download",
            get(modules::download),
        )
        .route(
            "/v1/providers/{namespace}/{provider_type}/versions",
            get(providers::list_versions),
        )
        .route(
            "/v1/providers/{namespace}/{provider_type}/{version}/download/{os}/{arch}",
            get(providers::download),
        )
        .route(
            "/terraform/providers/{hostname}/{namespace}/{provider_type}/index.json",
            get(netmirror::index),
        )
        .route(
            "/terraform/providers/{hostname}/{namespace}/{provider_type}/{version_json}",
            get(netmirror::archives),
        )
        .route("/terraform/binaries", get(binaries::list_configs))
        .route("/terraform/binaries/{name}/versions", get(binaries::list_versions))
        .route(
            "/terraform/binaries/{name}/versions/latest",
            get(binaries::latest_version),
        )
        .route(
            "/terraform/binaries/{name}/versions/{version}",
            get(binaries::get_version),
        )
        .route(
            "/terraform/binaries/{name}/versions/{version}/{os}/{arch}",
            get(binaries::download),
        )
        .route("/files/{*path}", get(files::serve));

    let webhook = Router::new()
        .route("/webhooks/scm/{repo_id}/{secret}", post(webhooks::receive))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .merge(protocol)
        .merge(webhook)
        .nest("/api/v1", mgmt::router(state.clone()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::optional_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness exercises the storage path without writing state. A registry
/// with no storage configured yet is still "ready" so the setup wizard can
/// run.
async fn readyz(State(state): State<AppState>) -> Response {
    match state.storage.get().await {
        Ok(backend) => match backend.readiness_probe().await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(error) => {
                tracing::warn!(%error, "storage readiness probe failed");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        },
        Err(crate::storage::StorageError::NotConfigured) => StatusCode::OK.into_response(),
        Err(error) => {
            tracing::warn!(%error, "storage initialization failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&crate::observability::metrics::gather(), &mut buffer) {
        tracing::error!(%error, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Client address the rate limiter keys on.
///
/// `X-Forwarded-For` is client-controlled, so it is only consulted when the
/// deployment opted in via `trust_proxy_headers` (a reverse proxy that
/// rewrites the header). Everything else uses the peer socket address.
pub(crate) fn client_ip(request: &Request, trust_proxy_headers: bool) -> IpAddr {
    if trust_proxy_headers {
        if let Some(forwarded) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn rate_limit(
    class: RouteClass,
    state: &AppState,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request, state.trust_proxy_headers);
    match state.limiter.check(class, ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => ApiError::RateLimited { retry_after_secs }.into_response(),
    }
}

pub(crate) async fn rate_limit_api(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    rate_limit(RouteClass::Api, &state, request, next).await
}

pub(crate) async fn rate_limit_upload(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    rate_limit(RouteClass::Upload, &state, request, next).await
}

pub(crate) async fn rate_limit_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    rate_limit(RouteClass::Auth, &state, request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_forwarded(ip: &str) -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .expect("request construction cannot fail")
    }

    #[test]
    fn test_spoofed_forwarded_header_ignored_by_default() {
        let request = request_with_forwarded("203.0.113.7");
        // Without a trusted proxy the header is not consulted; with no
        // socket info either, attribution falls back to localhost.
        assert_eq!(
            client_ip(&request, false),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn test_forwarded_header_used_behind_trusted_proxy() {
        let request = request_with_forwarded("203.0.113.7, 10.0.0.1");
        assert_eq!(
            client_ip(&request, true),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_socket_address_wins_without_header() {
        let mut request = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("request construction cannot fail");
        let addr: SocketAddr = "192.0.2.9:443".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(client_ip(&request, true), addr.ip());
    }
}
