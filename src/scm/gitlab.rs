//! GitLab connector (gitlab.com and self-managed).
//!
//! GitLab webhooks carry a shared token in `X-Gitlab-Token` rather than an
//! HMAC signature; verification is a constant-time equality check.

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use super::{
    api_client, archive_client, check_status, constant_time_eq, ArchiveStream, ConnectorConfig,
    OAuthToken, Pagination, RemoteRepo, ScmBranch, ScmConnector, ScmError, ScmProviderType,
    ScmTag, WebhookEventInfo, WebhookEventKind,
};

pub struct GitlabConnector {
    config: ConnectorConfig,
    api: reqwest::Client,
    archive: reqwest::Client,
}

impl std::fmt::Debug for GitlabConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitlabConnector").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TagRow {
    name: String,
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    id: String,
}

#[derive(Deserialize)]
struct ProjectRow {
    path: String,
    #[serde(default)]
    default_branch: Option<String>,
    namespace: NamespaceRef,
}

#[derive(Deserialize)]
struct NamespaceRef {
    full_path: String,
}

impl GitlabConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            api: api_client(),
            archive: archive_client(),
        }
    }

    fn base(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://gitlab.com".to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn api_base(&self) -> String {
        format!("{}/api/v4", self.base())
    }

    /// GitLab addresses projects by URL-encoded `owner/repo`.
    fn project_id(owner: &str, repo: &str) -> String {
        format!("{owner}%2F{repo}")
    }

    fn bearer(&self, req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ScmConnector for GitlabConnector {
    fn provider_type(&self) -> ScmProviderType {
        ScmProviderType::Gitlab
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&state={}&scope=api",
            self.base(),
            self.config.client_id,
            redirect_uri,
            state
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post(format!("{}/oauth/token", self.base()))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_deref().unwrap_or("")),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        check_status(response, "gitlab token exchange")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post(format!("{}/oauth/token", self.base()))
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_deref().unwrap_or("")),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        check_status(response, "gitlab token refresh")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))
    }

    async fn fetch_tags(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        page: Pagination,
    ) -> Result<Vec<ScmTag>, ScmError> {
        let req = self.api.get(format!(
            "{}/projects/{}/repository/tags?per_page={}&page={}",
            self.api_base(),
            Self::project_id(owner, repo),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Vec<TagRow> = check_status(response, "gitlab list tags")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|t| ScmTag {
                name: t.name,
                commit_sha: t.commit.id,
            })
            .collect())
    }

    async fn fetch_branches(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        page: Pagination,
    ) -> Result<Vec<ScmBranch>, ScmError> {
        let req = self.api.get(format!(
            "{}/projects/{}/repository/branches?per_page={}&page={}",
            self.api_base(),
            Self::project_id(owner, repo),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Vec<TagRow> = check_status(response, "gitlab list branches")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|b| ScmBranch {
                name: b.name,
                commit_sha: b.commit.id,
            })
            .collect())
    }

    async fn list_repositories(
        &self,
        token: &str,
        page: Pagination,
    ) -> Result<Vec<RemoteRepo>, ScmError> {
        let response = self
            .api
            .get(format!(
                "{}/projects?membership=true&per_page={}&page={}&order_by=last_activity_at",
                self.api_base(),
                page.per_page,
                page.page
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let rows: Vec<ProjectRow> = check_status(response, "gitlab list projects")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|p| RemoteRepo {
                owner: p.namespace.full_path,
                name: p.path,
                default_branch: p.default_branch,
            })
            .collect())
    }

    async fn download_source_archive(
        &self,
        token: Option<&str>,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<ArchiveStream, ScmError> {
        let req = self.archive.get(format!(
            "{}/projects/{}/repository/archive.tar.gz?sha={git_ref}",
            self.api_base(),
            Self::project_id(owner, repo)
        ));
        let response = self.bearer(req, token).send().await?;
        let response = check_status(response, "gitlab archive download")?;
        Ok(super::response_stream(response))
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, _body: &[u8], secret: &str) -> bool {
        headers
            .get("x-gitlab-token")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|token| constant_time_eq(token, secret))
    }

    fn parse_webhook_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookEventInfo, ScmError> {
        let event_type = headers
            .get("x-gitlab-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let event_id = headers
            .get("x-gitlab-event-uuid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ScmError::Decode(e.to_string()))?;

        let ref_name = payload["ref"].as_str().map(str::to_string);
        let commit_sha = payload["checkout_sha"]
            .as_str()
            .or_else(|| payload["after"].as_str())
            .map(str::to_string);
        let tag_name = ref_name
            .as_deref()
            .and_then(|r| r.strip_prefix("refs/tags/"))
            .map(str::to_string);
        let kind = if event_type == "Tag Push Hook" || tag_name.is_some() {
            WebhookEventKind::TagPush
        } else if event_type == "Push Hook" {
            WebhookEventKind::Push
        } else {
            WebhookEventKind::Other
        };

        Ok(WebhookEventInfo {
            event_id,
            event_type,
            kind,
            ref_name,
            tag_name,
            commit_sha,
        })
    }

    async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        url: &str,
        secret: &str,
    ) -> Result<String, ScmError> {
        let response = self
            .api
            .post(format!(
                "{}/projects/{}/hooks",
                self.api_base(),
                Self::project_id(owner, repo)
            ))
            .bearer_auth(token)
            .json(&json!({
                "url": url,
                "push_events": true,
                "tag_push_events": true,
                "token": secret,
                "enable_ssl_verification": true,
            }))
            .send()
            .await?;
        let created: serde_json::Value = check_status(response, "gitlab create webhook")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        created["id"]
            .as_i64()
            .map(|id| id.to_string())
            .ok_or_else(|| ScmError::Decode("webhook id missing".to_string()))
    }

    async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        webhook_id: &str,
    ) -> Result<(), ScmError> {
        let response = self
            .api
            .delete(format!(
                "{}/projects/{}/hooks/{webhook_id}",
                self.api_base(),
                Self::project_id(owner, repo)
            ))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "gitlab delete webhook")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> GitlabConnector {
        GitlabConnector::new(ConnectorConfig {
            provider_type: ScmProviderType::Gitlab,
            base_url: None,
            client_id: "client".to_string(),
            client_secret: None,
            tenant_id: None,
        })
    }

    #[test]
    fn test_token_header_verification() {
        let c = connector();
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", "hook-secret".parse().unwrap());
        assert!(c.verify_webhook_signature(&headers, b"{}", "hook-secret"));
        assert!(!c.verify_webhook_signature(&headers, b"{}", "other"));
        assert!(!c.verify_webhook_signature(&HeaderMap::new(), b"{}", "hook-secret"));
    }

    #[test]
    fn test_parse_tag_push_hook() {
        let c = connector();
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", "Tag Push Hook".parse().unwrap());
        let body = br#"{"ref":"refs/tags/v1.2.3","checkout_sha":"deadbeef"}"#;
        let event = c.parse_webhook_event(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TagPush);
        assert_eq!(event.tag_name.as_deref(), Some("v1.2.3"));
        assert_eq!(event.commit_sha.as_deref(), Some("deadbeef"));
    }
}
