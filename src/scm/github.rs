//! GitHub connector (github.com and GitHub Enterprise Server).

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use super::{
    api_client, archive_client, check_status, constant_time_eq, hmac_sha256_hex, ArchiveStream,
    ConnectorConfig, OAuthToken, Pagination, RemoteRepo, ScmBranch, ScmConnector, ScmError,
    ScmProviderType, ScmTag, WebhookEventInfo, WebhookEventKind,
};

pub struct GithubConnector {
    config: ConnectorConfig,
    api: reqwest::Client,
    archive: reqwest::Client,
}

impl std::fmt::Debug for GithubConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubConnector").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TagRow {
    name: String,
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct BranchRow {
    name: String,
    commit: CommitRef,
}

#[derive(Deserialize)]
struct RepoRow {
    name: String,
    owner: OwnerRef,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct OwnerRef {
    login: String,
}

impl GithubConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            api: api_client(),
            archive: archive_client(),
        }
    }

    /// REST base: `https://api.github.com` for the cloud, `<base>/api/v3`
    /// for GitHub Enterprise Server.
    fn api_base(&self) -> String {
        match &self.config.base_url {
            Some(base) => format!("{}/api/v3", base.trim_end_matches('/')),
            None => "https://api.github.com".to_string(),
        }
    }

    fn web_base(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://github.com".to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn bearer(&self, req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ScmConnector for GithubConnector {
    fn provider_type(&self) -> ScmProviderType {
        ScmProviderType::Github
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}/login/oauth/authorize?client_id={}&redirect_uri={}&state={}&scope=repo",
            self.web_base(),
            self.config.client_id,
            redirect_uri,
            state
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post(format!("{}/login/oauth/access_token", self.web_base()))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_deref().unwrap_or("")),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        check_status(response, "github token exchange")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post(format!("{}/login/oauth/access_token", self.web_base()))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_deref().unwrap_or("")),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        check_status(response, "github token refresh")?
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
            "{}/repos/{owner}/{repo}/tags?per_page={}&page={}",
            self.api_base(),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Vec<TagRow> = check_status(response, "github list tags")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|t| ScmTag {
                name: t.name,
                commit_sha: t.commit.sha,
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
            "{}/repos/{owner}/{repo}/branches?per_page={}&page={}",
            self.api_base(),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Vec<BranchRow> = check_status(response, "github list branches")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|b| ScmBranch {
                name: b.name,
                commit_sha: b.commit.sha,
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
                "{}/user/repos?per_page={}&page={}&sort=updated",
                self.api_base(),
                page.per_page,
                page.page
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let rows: Vec<RepoRow> = check_status(response, "github list repositories")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| RemoteRepo {
                owner: r.owner.login,
                name: r.name,
                default_branch: r.default_branch,
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
            "{}/repos/{owner}/{repo}/tarball/{git_ref}",
            self.api_base()
        ));
        let response = self.bearer(req, token).send().await?;
        let response = check_status(response, "github archive download")?;
        Ok(super::response_stream(response))
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
        let Some(header) = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(provided) = header.strip_prefix("sha256=") else {
            return false;
        };
        constant_time_eq(provided, &hmac_sha256_hex(secret, body))
    }

    fn parse_webhook_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookEventInfo, ScmError> {
        let event_type = headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let event_id = headers
            .get("x-github-delivery")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ScmError::Decode(e.to_string()))?;

        let (kind, ref_name, tag_name, commit_sha) = match event_type.as_str() {
            "push" => {
                let ref_name = payload["ref"].as_str().map(str::to_string);
                let tag = ref_name
                    .as_deref()
                    .and_then(|r| r.strip_prefix("refs/tags/"))
                    .map(str::to_string);
                let commit = payload["after"].as_str().map(str::to_string);
                let kind = if tag.is_some() {
                    WebhookEventKind::TagPush
                } else {
                    WebhookEventKind::Push
                };
                (kind, ref_name, tag, commit)
            }
            "create" if payload["ref_type"] == "tag" => {
                let tag = payload["ref"].as_str().map(str::to_string);
                (WebhookEventKind::TagPush, tag.clone(), tag, None)
            }
            _ => (WebhookEventKind::Other, None, None, None),
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
            .post(format!("{}/repos/{owner}/{repo}/hooks", self.api_base()))
            .bearer_auth(token)
            .json(&json!({
                "name": "web",
                "active": true,
                "events": ["push", "create"],
                "config": {
                    "url": url,
                    "content_type": "json",
                    "secret": secret,
                },
            }))
            .send()
            .await?;
        let created: serde_json::Value = check_status(response, "github create webhook")?
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
                "{}/repos/{owner}/{repo}/hooks/{webhook_id}",
                self.api_base()
            ))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "github delete webhook")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> GithubConnector {
        GithubConnector::new(ConnectorConfig {
            provider_type: ScmProviderType::Github,
            base_url: None,
            client_id: "client".to_string(),
            client_secret: Some("secret".to_string()),
            tenant_id: None,
        })
    }

    #[test]
    fn test_signature_verification() {
        let c = connector();
        let body = br#"{"ref":"refs/tags/v1.0.0"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            format!("sha256={}", hmac_sha256_hex("hook-secret", body))
                .parse()
                .unwrap(),
        );
        assert!(c.verify_webhook_signature(&headers, body, "hook-secret"));
        assert!(!c.verify_webhook_signature(&headers, body, "wrong-secret"));
        assert!(!c.verify_webhook_signature(&HeaderMap::new(), body, "hook-secret"));
    }

    #[test]
    fn test_parse_tag_push() {
        let c = connector();
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "push".parse().unwrap());
        headers.insert("x-github-delivery", "delivery-42".parse().unwrap());
        let body = br#"{"ref":"refs/tags/v2.0.0","after":"abc123"}"#;
        let event = c.parse_webhook_event(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TagPush);
        assert_eq!(event.tag_name.as_deref(), Some("v2.0.0"));
        assert_eq!(event.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(event.event_id.as_deref(), Some("delivery-42"));
    }

    #[test]
    fn test_parse_branch_push_is_not_tag() {
        let c = connector();
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "push".parse().unwrap());
        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#;
        let event = c.parse_webhook_event(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::Push);
        assert!(event.tag_name.is_none());
    }

    #[test]
    fn test_enterprise_api_base() {
        let c = GithubConnector::new(ConnectorConfig {
            provider_type: ScmProviderType::Github,
            base_url: Some("https://github.example.com/".to_string()),
            client_id: "client".to_string(),
            client_secret: None,
            tenant_id: None,
        });
        assert_eq!(c.api_base(), "https://github.example.com/api/v3");
    }
}
