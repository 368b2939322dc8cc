//! Bitbucket Cloud connector. Data Center deployments point `base_url` at
//! their instance; the REST surface used here is shared between the two.

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use super::{
    api_client, archive_client, check_status, constant_time_eq, hmac_sha256_hex, ArchiveStream,
    ConnectorConfig, OAuthToken, Pagination, RemoteRepo, ScmBranch, ScmConnector, ScmError,
    ScmProviderType, ScmTag, WebhookEventInfo, WebhookEventKind,
};

pub struct BitbucketConnector {
    config: ConnectorConfig,
    api: reqwest::Client,
    archive: reqwest::Client,
}

impl std::fmt::Debug for BitbucketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbucketConnector").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Paged<T> {
    values: Vec<T>,
}

#[derive(Deserialize)]
struct RefRow {
    name: String,
    target: TargetRef,
}

#[derive(Deserialize)]
struct TargetRef {
    hash: String,
}

#[derive(Deserialize)]
struct RepoRow {
    slug: String,
    full_name: String,
    #[serde(default)]
    mainbranch: Option<MainBranch>,
}

#[derive(Deserialize)]
struct MainBranch {
    name: String,
}

impl BitbucketConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            api: api_client(),
            archive: archive_client(),
        }
    }

    fn api_base(&self) -> String {
        match &self.config.base_url {
            Some(base) => format!("{}/rest/api/latest", base.trim_end_matches('/')),
            None => "https://api.bitbucket.org/2.0".to_string(),
        }
    }

    fn web_base(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://bitbucket.org".to_string())
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
impl ScmConnector for BitbucketConnector {
    fn provider_type(&self) -> ScmProviderType {
        ScmProviderType::Bitbucket
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "https://bitbucket.org/site/oauth2/authorize?client_id={}&response_type=code&redirect_uri={}&state={}",
            self.config.client_id, redirect_uri, state
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post("https://bitbucket.org/site/oauth2/access_token")
            .basic_auth(
                &self.config.client_id,
                self.config.client_secret.as_deref(),
            )
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        check_status(response, "bitbucket token exchange")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post("https://bitbucket.org/site/oauth2/access_token")
            .basic_auth(
                &self.config.client_id,
                self.config.client_secret.as_deref(),
            )
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        check_status(response, "bitbucket token refresh")?
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
            "{}/repositories/{owner}/{repo}/refs/tags?pagelen={}&page={}",
            self.api_base(),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Paged<RefRow> = check_status(response, "bitbucket list tags")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .values
            .into_iter()
            .map(|t| ScmTag {
                name: t.name,
                commit_sha: t.target.hash,
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
            "{}/repositories/{owner}/{repo}/refs/branches?pagelen={}&page={}",
            self.api_base(),
            page.per_page,
            page.page
        ));
        let response = self.bearer(req, token).send().await?;
        let rows: Paged<RefRow> = check_status(response, "bitbucket list branches")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .values
            .into_iter()
            .map(|b| ScmBranch {
                name: b.name,
                commit_sha: b.target.hash,
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
                "{}/repositories?role=member&pagelen={}&page={}",
                self.api_base(),
                page.per_page,
                page.page
            ))
            .bearer_auth(token)
            .send()
            .await?;
        let rows: Paged<RepoRow> = check_status(response, "bitbucket list repositories")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .values
            .into_iter()
            .map(|r| {
                let owner = r
                    .full_name
                    .split_once('/')
                    .map(|(o, _)| o.to_string())
                    .unwrap_or_default();
                RemoteRepo {
                    owner,
                    name: r.slug,
                    default_branch: r.mainbranch.map(|b| b.name),
                }
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
            "{}/{owner}/{repo}/get/{git_ref}.tar.gz",
            self.web_base()
        ));
        let response = self.bearer(req, token).send().await?;
        let response = check_status(response, "bitbucket archive download")?;
        Ok(super::response_stream(response))
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
        let Some(header) = headers.get("x-hub-signature").and_then(|v| v.to_str().ok()) else {
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
            .get("x-event-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let event_id = headers
            .get("x-request-uuid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ScmError::Decode(e.to_string()))?;

        // repo:push carries a change list; a tag push has change.new.type == "tag".
        let change = &payload["push"]["changes"][0]["new"];
        let (kind, ref_name, tag_name, commit_sha) = if event_type == "repo:push" {
            let name = change["name"].as_str().map(str::to_string);
            let commit = change["target"]["hash"].as_str().map(str::to_string);
            if change["type"] == "tag" {
                (
                    WebhookEventKind::TagPush,
                    name.clone().map(|n| format!("refs/tags/{n}")),
                    name,
                    commit,
                )
            } else {
                (WebhookEventKind::Push, name, None, commit)
            }
        } else {
            (WebhookEventKind::Other, None, None, None)
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
            .post(format!("{}/repositories/{owner}/{repo}/hooks", self.api_base()))
            .bearer_auth(token)
            .json(&json!({
                "description": "terraform-registry",
                "url": url,
                "active": true,
                "secret": secret,
                "events": ["repo:push"],
            }))
            .send()
            .await?;
        let created: serde_json::Value = check_status(response, "bitbucket create webhook")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        created["uuid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScmError::Decode("webhook uuid missing".to_string()))
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
                "{}/repositories/{owner}/{repo}/hooks/{webhook_id}",
                self.api_base()
            ))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "bitbucket delete webhook")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> BitbucketConnector {
        BitbucketConnector::new(ConnectorConfig {
            provider_type: ScmProviderType::Bitbucket,
            base_url: None,
            client_id: "client".to_string(),
            client_secret: None,
            tenant_id: None,
        })
    }

    #[test]
    fn test_parse_tag_push() {
        let c = connector();
        let mut headers = HeaderMap::new();
        headers.insert("x-event-key", "repo:push".parse().unwrap());
        let body = br#"{"push":{"changes":[{"new":{"type":"tag","name":"v3.0.0","target":{"hash":"cafe12"}}}]}}"#;
        let event = c.parse_webhook_event(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TagPush);
        assert_eq!(event.tag_name.as_deref(), Some("v3.0.0"));
        assert_eq!(event.commit_sha.as_deref(), Some("cafe12"));
    }

    #[test]
    fn test_signature_verification() {
        let c = connector();
        let body = b"payload";
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature",
            format!("sha256={}", hmac_sha256_hex("s", body)).parse().unwrap(),
        );
        assert!(c.verify_webhook_signature(&headers, body, "s"));
        assert!(!c.verify_webhook_signature(&headers, body, "t"));
    }
}
