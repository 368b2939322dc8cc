//! # SCM Connectors
//!
//! Uniform capability over GitHub, GitLab, Bitbucket, and Azure DevOps:
//! OAuth, tag/branch listing, source-archive download, and webhook
//! management plus signature verification.
//!
//! Connectors register in a per-provider-type factory, mirroring the storage
//! backend registry. Tokens presented here are plaintext; callers decrypt
//! them with the token cipher first.

pub mod azure_devops;
pub mod bitbucket;
pub mod github;
pub mod gitlab;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::constants::{ARTIFACT_DOWNLOAD_TIMEOUT_SECS, SCM_API_TIMEOUT_SECS};

/// Source archive byte stream (gzip-compressed tarball).
pub type ArchiveStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmProviderType {
    Github,
    Gitlab,
    Bitbucket,
    AzureDevops,
}

impl ScmProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::AzureDevops => "azure_devops",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::Github),
            "gitlab" => Some(Self::Gitlab),
            "bitbucket" => Some(Self::Bitbucket),
            "azure_devops" => Some(Self::AzureDevops),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("scm request failed: {0}")]
    Http(String),
    #[error("scm authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("unexpected scm response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ScmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmTag {
    pub name: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmBranch {
    pub name: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone)]
pub struct RemoteRepo {
    pub owner: String,
    pub name: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    TagPush,
    Push,
    Other,
}

/// Normalized view of an incoming webhook payload.
#[derive(Debug, Clone)]
pub struct WebhookEventInfo {
    pub event_id: Option<String>,
    pub event_type: String,
    pub kind: WebhookEventKind,
    pub ref_name: Option<String>,
    pub tag_name: Option<String>,
    pub commit_sha: Option<String>,
}

/// Per-provider connection settings, decrypted from the SCM provider row.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub provider_type: ScmProviderType,
    pub base_url: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
}

/// Uniform SCM capability.
#[async_trait::async_trait]
pub trait ScmConnector: Send + Sync {
    fn provider_type(&self) -> ScmProviderType;

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String;

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken, ScmError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, ScmError>;

    async fn fetch_tags(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        page: Pagination,
    ) -> Result<Vec<ScmTag>, ScmError>;

    async fn fetch_branches(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        page: Pagination,
    ) -> Result<Vec<ScmBranch>, ScmError>;

    async fn list_repositories(
        &self,
        token: &str,
        page: Pagination,
    ) -> Result<Vec<RemoteRepo>, ScmError>;

    /// Gzip tarball of the repository at an exact ref.
    async fn download_source_archive(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<ArchiveStream, ScmError>;

    /// Constant-time verification of the provider's webhook signature.
    fn verify_webhook_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool;

    fn parse_webhook_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookEventInfo, ScmError>;

    async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        url: &str,
        secret: &str,
    ) -> Result<String, ScmError>;

    async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        webhook_id: &str,
    ) -> Result<(), ScmError>;

    /// Resolve a tag to its current commit, paging through the tag list.
    async fn get_tag_commit(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        tag: &str,
    ) -> Result<Option<String>, ScmError> {
        let mut page = Pagination::default();
        loop {
            let tags = self.fetch_tags(token, owner, repo, page).await?;
            if let Some(found) = tags.iter().find(|t| t.name == tag) {
                return Ok(Some(found.commit_sha.clone()));
            }
            if (tags.len() as u32) < page.per_page || page.page >= 20 {
                return Ok(None);
            }
            page.page += 1;
        }
    }
}

pub type ConnectorFactoryFn =
    Arc<dyn Fn(ConnectorConfig) -> Arc<dyn ScmConnector> + Send + Sync>;

/// Factory registry keyed by provider type. Registered at init, read-only
/// afterwards; tests build their own instance.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<ScmProviderType, ConnectorFactoryFn>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry").finish_non_exhaustive()
    }
}

static GLOBAL_CONNECTORS: LazyLock<ConnectorRegistry> = LazyLock::new(|| {
    let registry = ConnectorRegistry::default();
    registry.register_builtin();
    registry
});

impl ConnectorRegistry {
    pub fn global() -> &'static ConnectorRegistry {
        &GLOBAL_CONNECTORS
    }

    pub fn register(&self, provider_type: ScmProviderType, factory: ConnectorFactoryFn) {
        self.factories
            .write()
            .expect("connector registry lock poisoned")
            .insert(provider_type, factory);
    }

    pub fn register_builtin(&self) {
        self.register(
            ScmProviderType::Github,
            Arc::new(|c| Arc::new(github::GithubConnector::new(c))),
        );
        self.register(
            ScmProviderType::Gitlab,
            Arc::new(|c| Arc::new(gitlab::GitlabConnector::new(c))),
        );
        self.register(
            ScmProviderType::Bitbucket,
            Arc::new(|c| Arc::new(bitbucket::BitbucketConnector::new(c))),
        );
        self.register(
            ScmProviderType::AzureDevops,
            Arc::new(|c| Arc::new(azure_devops::AzureDevopsConnector::new(c))),
        );
    }

    pub fn create(&self, config: ConnectorConfig) -> Result<Arc<dyn ScmConnector>, ScmError> {
        let factory = self
            .factories
            .read()
            .expect("connector registry lock poisoned")
            .get(&config.provider_type)
            .cloned()
            .ok_or_else(|| {
                ScmError::Unsupported(format!(
                    "no connector registered for {}",
                    config.provider_type.as_str()
                ))
            })?;
        Ok(factory(config))
    }
}

/// API client with the standard SCM timeout.
pub(crate) fn api_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(SCM_API_TIMEOUT_SECS))
        .user_agent("terraform-registry")
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

/// Client for archive downloads, with the long artifact timeout.
pub(crate) fn archive_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(ARTIFACT_DOWNLOAD_TIMEOUT_SECS))
        .user_agent("terraform-registry")
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

/// Hex HMAC-SHA256 over a webhook body.
pub(crate) fn hmac_sha256_hex(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison for signatures and shared secrets.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Turn a streaming HTTP response body into an [`ArchiveStream`].
pub(crate) fn response_stream(response: reqwest::Response) -> ArchiveStream {
    use futures::TryStreamExt;
    Box::pin(tokio_util::io::StreamReader::new(
        response.bytes_stream().map_err(std::io::Error::other),
    ))
}

/// Fail on non-2xx, mapping 404 and auth statuses to their own kinds.
pub(crate) fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, ScmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        401 | 403 => Err(ScmError::Auth(format!("{what}: HTTP {status}"))),
        404 => Err(ScmError::NotFound(format!("{what}: not found"))),
        _ => Err(ScmError::Http(format!("{what}: HTTP {status}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_roundtrip() {
        for ty in [
            ScmProviderType::Github,
            ScmProviderType::Gitlab,
            ScmProviderType::Bitbucket,
            ScmProviderType::AzureDevops,
        ] {
            assert_eq!(ScmProviderType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ScmProviderType::parse("svn"), None);
    }

    #[test]
    fn test_hmac_hex_is_stable() {
        let sig = hmac_sha256_hex("secret", b"payload");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, hmac_sha256_hex("secret", b"payload"));
        assert_ne!(sig, hmac_sha256_hex("other", b"payload"));
    }
}
