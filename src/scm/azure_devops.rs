//! Azure DevOps connector.
//!
//! `owner` maps to the DevOps project and `repo` to the repository within
//! it; the organization comes from `base_url`
//! (`https://dev.azure.com/<organization>`). Service hooks do not sign
//! payloads, so webhook verification checks the basic-auth credential the
//! subscription was created with.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::json;

use super::{
    api_client, archive_client, check_status, constant_time_eq, ArchiveStream, ConnectorConfig,
    OAuthToken, Pagination, RemoteRepo, ScmBranch, ScmConnector, ScmError, ScmProviderType,
    ScmTag, WebhookEventInfo, WebhookEventKind,
};

const API_VERSION: &str = "7.0";

pub struct AzureDevopsConnector {
    config: ConnectorConfig,
    api: reqwest::Client,
    archive: reqwest::Client,
}

impl std::fmt::Debug for AzureDevopsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureDevopsConnector").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ValueList<T> {
    value: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitRef {
    name: String,
    object_id: String,
    #[serde(default)]
    peeled_object_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitRepo {
    name: String,
    #[serde(default)]
    default_branch: Option<String>,
    project: ProjectRef,
}

#[derive(Deserialize)]
struct ProjectRef {
    name: String,
}

impl AzureDevopsConnector {
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
            .unwrap_or_else(|| "https://dev.azure.com".to_string())
            .trim_end_matches('/')
            .to_string()
    }

    fn auth(&self, req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        // PATs go through basic auth with an empty user; OAuth tokens are bearer.
        match token {
            Some(t) if t.len() == 52 => req.basic_auth("", Some(t)),
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ScmConnector for AzureDevopsConnector {
    fn provider_type(&self) -> ScmProviderType {
        ScmProviderType::AzureDevops
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "https://app.vssps.visualstudio.com/oauth2/authorize?client_id={}&response_type=Assertion&state={}&scope=vso.code&redirect_uri={}",
            self.config.client_id, state, redirect_uri
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post("https://app.vssps.visualstudio.com/oauth2/token")
            .form(&[
                ("client_assertion_type", "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"),
                ("client_assertion", self.config.client_secret.as_deref().unwrap_or("")),
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        check_status(response, "azure devops token exchange")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, ScmError> {
        let response = self
            .api
            .post("https://app.vssps.visualstudio.com/oauth2/token")
            .form(&[
                ("client_assertion_type", "urn:ietf:params:oauth:client-assertion-type:jwt-bearer"),
                ("client_assertion", self.config.client_secret.as_deref().unwrap_or("")),
                ("grant_type", "refresh_token"),
                ("assertion", refresh_token),
            ])
            .send()
            .await?;
        check_status(response, "azure devops token refresh")?
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
        let skip = (page.page.saturating_sub(1)) * page.per_page;
        let req = self.api.get(format!(
            "{}/{owner}/_apis/git/repositories/{repo}/refs?filter=tags/&$top={}&$skip={}&peelTags=true&api-version={API_VERSION}",
            self.base(),
            page.per_page,
            skip
        ));
        let response = self.auth(req, token).send().await?;
        let rows: ValueList<GitRef> = check_status(response, "azure devops list tags")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .value
            .into_iter()
            .map(|r| ScmTag {
                name: r
                    .name
                    .strip_prefix("refs/tags/")
                    .unwrap_or(&r.name)
                    .to_string(),
                // Annotated tags peel to the commit they point at.
                commit_sha: r.peeled_object_id.unwrap_or(r.object_id),
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
        let skip = (page.page.saturating_sub(1)) * page.per_page;
        let req = self.api.get(format!(
            "{}/{owner}/_apis/git/repositories/{repo}/refs?filter=heads/&$top={}&$skip={}&api-version={API_VERSION}",
            self.base(),
            page.per_page,
            skip
        ));
        let response = self.auth(req, token).send().await?;
        let rows: ValueList<GitRef> = check_status(response, "azure devops list branches")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .value
            .into_iter()
            .map(|r| ScmBranch {
                name: r
                    .name
                    .strip_prefix("refs/heads/")
                    .unwrap_or(&r.name)
                    .to_string(),
                commit_sha: r.object_id,
            })
            .collect())
    }

    async fn list_repositories(
        &self,
        token: &str,
        _page: Pagination,
    ) -> Result<Vec<RemoteRepo>, ScmError> {
        let req = self.api.get(format!(
            "{}/_apis/git/repositories?api-version={API_VERSION}",
            self.base()
        ));
        let response = self.auth(req, Some(token)).send().await?;
        let rows: ValueList<GitRepo> = check_status(response, "azure devops list repositories")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        Ok(rows
            .value
            .into_iter()
            .map(|r| RemoteRepo {
                owner: r.project.name,
                name: r.name,
                default_branch: r
                    .default_branch
                    .map(|b| b.strip_prefix("refs/heads/").unwrap_or(&b).to_string()),
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
            "{}/{owner}/_apis/git/repositories/{repo}/items?path=/&versionDescriptor.version={git_ref}&versionDescriptor.versionType=commit&resolveLfs=true&$format=tar.gz&api-version={API_VERSION}",
            self.base()
        ));
        let response = self.auth(req, token).send().await?;
        let response = check_status(response, "azure devops archive download")?;
        Ok(super::response_stream(response))
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, _body: &[u8], secret: &str) -> bool {
        // Service hooks authenticate with the basic credential configured on
        // the subscription; the password half carries the shared secret.
        let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(encoded) = auth.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded) else {
            return false;
        };
        let Ok(credential) = String::from_utf8(decoded) else {
            return false;
        };
        let password = credential.split_once(':').map(|(_, p)| p).unwrap_or("");
        constant_time_eq(password, secret)
    }

    fn parse_webhook_event(
        &self,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookEventInfo, ScmError> {
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ScmError::Decode(e.to_string()))?;
        let event_type = payload["eventType"].as_str().unwrap_or("unknown").to_string();
        let event_id = payload["id"].as_str().map(str::to_string);

        let update = &payload["resource"]["refUpdates"][0];
        let ref_name = update["name"].as_str().map(str::to_string);
        let commit_sha = update["newObjectId"].as_str().map(str::to_string);
        let tag_name = ref_name
            .as_deref()
            .and_then(|r| r.strip_prefix("refs/tags/"))
            .map(str::to_string);
        let kind = if event_type != "git.push" {
            WebhookEventKind::Other
        } else if tag_name.is_some() {
            WebhookEventKind::TagPush
        } else {
            WebhookEventKind::Push
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
        _repo: &str,
        url: &str,
        secret: &str,
    ) -> Result<String, ScmError> {
        let response = self
            .api
            .post(format!(
                "{}/_apis/hooks/subscriptions?api-version={API_VERSION}",
                self.base()
            ))
            .bearer_auth(token)
            .json(&json!({
                "publisherId": "tfs",
                "eventType": "git.push",
                "resourceVersion": "1.0",
                "consumerId": "webHooks",
                "consumerActionId": "httpRequest",
                "publisherInputs": { "projectId": owner },
                "consumerInputs": {
                    "url": url,
                    "basicAuthUsername": "registry",
                    "basicAuthPassword": secret,
                },
            }))
            .send()
            .await?;
        let created: serde_json::Value = check_status(response, "azure devops create webhook")?
            .json()
            .await
            .map_err(|e| ScmError::Decode(e.to_string()))?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScmError::Decode("subscription id missing".to_string()))
    }

    async fn delete_webhook(
        &self,
        token: &str,
        _owner: &str,
        _repo: &str,
        webhook_id: &str,
    ) -> Result<(), ScmError> {
        let response = self
            .api
            .delete(format!(
                "{}/_apis/hooks/subscriptions/{webhook_id}?api-version={API_VERSION}",
                self.base()
            ))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response, "azure devops delete webhook")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> AzureDevopsConnector {
        AzureDevopsConnector::new(ConnectorConfig {
            provider_type: ScmProviderType::AzureDevops,
            base_url: Some("https://dev.azure.com/acme".to_string()),
            client_id: "client".to_string(),
            client_secret: None,
            tenant_id: None,
        })
    }

    #[test]
    fn test_basic_auth_verification() {
        let c = connector();
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("registry:hook-secret");
        headers.insert("authorization", format!("Basic {encoded}").parse().unwrap());
        assert!(c.verify_webhook_signature(&headers, b"{}", "hook-secret"));
        assert!(!c.verify_webhook_signature(&headers, b"{}", "other"));
    }

    #[test]
    fn test_parse_git_push_tag() {
        let c = connector();
        let body = br#"{
            "id": "evt-1",
            "eventType": "git.push",
            "resource": {"refUpdates": [{"name": "refs/tags/v1.0.0", "newObjectId": "0a1b2c"}]}
        }"#;
        let event = c.parse_webhook_event(&HeaderMap::new(), body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::TagPush);
        assert_eq!(event.tag_name.as_deref(), Some("v1.0.0"));
        assert_eq!(event.commit_sha.as_deref(), Some("0a1b2c"));
    }
}
