//! Upstream Provider Registry Protocol client.
//!
//! Speaks the same v1 protocol this registry serves, against the configured
//! upstream (e.g. `registry.terraform.io`).

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants::{ARTIFACT_DOWNLOAD_TIMEOUT_SECS, UPSTREAM_INDEX_TIMEOUT_SECS};

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamVersionEntry {
    pub version: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<UpstreamPlatformRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamPlatformRef {
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    versions: Vec<UpstreamVersionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamDownloadInfo {
    #[serde(default)]
    pub protocols: Vec<String>,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub download_url: String,
    #[serde(default)]
    pub shasums_url: Option<String>,
    #[serde(default)]
    pub shasums_signature_url: Option<String>,
    pub shasum: String,
    #[serde(default)]
    pub signing_keys: Option<SigningKeys>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeys {
    #[serde(default)]
    pub gpg_public_keys: Vec<GpgPublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpgPublicKey {
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub ascii_armor: Option<String>,
}

pub struct UpstreamRegistryClient {
    base_url: String,
    index: reqwest::Client,
    download: reqwest::Client,
}

impl std::fmt::Debug for UpstreamRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRegistryClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UpstreamRegistryClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            index: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(UPSTREAM_INDEX_TIMEOUT_SECS))
                .user_agent("terraform-registry")
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            download: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(ARTIFACT_DOWNLOAD_TIMEOUT_SECS))
                .user_agent("terraform-registry")
                .build()
                .expect("reqwest client construction cannot fail with static options"),
        }
    }

    pub async fn list_versions(
        &self,
        namespace: &str,
        provider_type: &str,
    ) -> Result<Vec<UpstreamVersionEntry>> {
        let url = format!(
            "{}/v1/providers/{namespace}/{provider_type}/versions",
            self.base_url
        );
        let response: VersionsResponse = self
            .index
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach upstream registry at {url}"))?
            .error_for_status()
            .with_context(|| format!("upstream rejected {url}"))?
            .json()
            .await
            .context("unexpected upstream versions payload")?;
        Ok(response.versions)
    }

    pub async fn download_info(
        &self,
        namespace: &str,
        provider_type: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<UpstreamDownloadInfo> {
        let url = format!(
            "{}/v1/providers/{namespace}/{provider_type}/{version}/download/{os}/{arch}",
            self.base_url
        );
        self.index
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach upstream registry at {url}"))?
            .error_for_status()
            .with_context(|| format!("upstream rejected {url}"))?
            .json()
            .await
            .context("unexpected upstream download payload")
    }

    /// Fetch and parse a `SHA256SUMS` document into filename → hex digest.
    pub async fn fetch_shasums(&self, url: &str) -> Result<HashMap<String, String>> {
        let body = self
            .index
            .get(url)
            .send()
            .await
            .with_context(|| format!("cannot fetch shasums from {url}"))?
            .error_for_status()?
            .text()
            .await?;
        let mut sums = HashMap::new();
        for line in body.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(sha), Some(filename)) = (parts.next(), parts.next()) {
                sums.insert(
                    filename.trim_start_matches('*').to_string(),
                    sha.to_string(),
                );
            }
        }
        Ok(sums)
    }

    /// Stream an artifact zip from the upstream distribution host.
    pub async fn download_artifact(
        &self,
        url: &str,
    ) -> Result<impl tokio::io::AsyncRead + Send + Unpin> {
        use futures::TryStreamExt;
        let response = self
            .download
            .get(url)
            .send()
            .await
            .with_context(|| format!("cannot download artifact from {url}"))?
            .error_for_status()
            .with_context(|| format!("artifact download rejected from {url}"))?;
        Ok(tokio_util::io::StreamReader::new(
            response.bytes_stream().map_err(std::io::Error::other),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shasums_parsing() {
        // Exercise the line parser through a local fixture shape.
        let body = "abc123  terraform-provider-aws_1.0.0_linux_amd64.zip\n\
                    def456 *terraform-provider-aws_1.0.0_darwin_arm64.zip\n\
                    \n\
                    malformed-line\n";
        let mut sums = HashMap::new();
        for line in body.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(sha), Some(filename)) = (parts.next(), parts.next()) {
                sums.insert(filename.trim_start_matches('*').to_string(), sha.to_string());
            }
        }
        assert_eq!(
            sums.get("terraform-provider-aws_1.0.0_linux_amd64.zip"),
            Some(&"abc123".to_string())
        );
        assert_eq!(
            sums.get("terraform-provider-aws_1.0.0_darwin_arm64.zip"),
            Some(&"def456".to_string())
        );
        assert_eq!(sums.len(), 2);
    }
}
