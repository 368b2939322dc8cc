//! Upstream release indexes for Terraform and OpenTofu binaries.
//!
//! Terraform releases come from the HashiCorp releases index; OpenTofu
//! releases come from the GitHub releases API. Both normalize into the same
//! [`Release`] shape for the sync worker.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::constants::{ARTIFACT_DOWNLOAD_TIMEOUT_SECS, UPSTREAM_INDEX_TIMEOUT_SECS};

const HASHICORP_RELEASES: &str = "https://releases.hashicorp.com";
const OPENTOFU_RELEASES: &str = "https://api.github.com/repos/opentofu/opentofu/releases";

#[derive(Debug, Clone)]
pub struct Release {
    pub version: String,
    pub prerelease: bool,
    pub release_date: Option<DateTime<Utc>>,
    pub platforms: Vec<ReleasePlatform>,
    pub shasums_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReleasePlatform {
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct HashicorpIndex {
    versions: std::collections::HashMap<String, HashicorpVersion>,
}

#[derive(Debug, Deserialize)]
struct HashicorpVersion {
    version: String,
    #[serde(default)]
    builds: Vec<HashicorpBuild>,
}

#[derive(Debug, Deserialize)]
struct HashicorpBuild {
    os: String,
    arch: String,
    filename: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    prerelease: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

pub struct ReleaseIndexClient {
    index: reqwest::Client,
    download: reqwest::Client,
}

impl std::fmt::Debug for ReleaseIndexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseIndexClient").finish_non_exhaustive()
    }
}

impl Default for ReleaseIndexClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseIndexClient {
    pub fn new() -> Self {
        Self {
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

    /// Fetch and normalize the release list for a tool.
    pub async fn fetch_index(&self, tool: &str, upstream_url: Option<&str>) -> Result<Vec<Release>> {
        match tool {
            "terraform" => self.fetch_hashicorp(upstream_url).await,
            "opentofu" => self.fetch_opentofu(upstream_url).await,
            other => bail!("unknown mirror tool {other:?}"),
        }
    }

    async fn fetch_hashicorp(&self, upstream_url: Option<&str>) -> Result<Vec<Release>> {
        let base = upstream_url
            .unwrap_or(HASHICORP_RELEASES)
            .trim_end_matches('/')
            .to_string();
        let url = format!("{base}/terraform/index.json");
        let index: HashicorpIndex = self
            .index
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot fetch release index from {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("unexpected release index payload")?;

        let mut releases: Vec<Release> = index
            .versions
            .into_values()
            .map(|v| {
                let shasums_url = format!(
                    "{base}/terraform/{0}/terraform_{0}_SHA256SUMS",
                    v.version
                );
                Release {
                    prerelease: v.version.contains('-'),
                    release_date: None,
                    platforms: v
                        .builds
                        .into_iter()
                        .map(|b| ReleasePlatform {
                            os: b.os,
                            arch: b.arch,
                            filename: b.filename,
                            url: b.url,
                        })
                        .collect(),
                    shasums_url: Some(shasums_url),
                    version: v.version,
                }
            })
            .collect();
        crate::semver::sort_descending(&mut releases, |r| &r.version);
        Ok(releases)
    }

    async fn fetch_opentofu(&self, upstream_url: Option<&str>) -> Result<Vec<Release>> {
        let url = upstream_url.unwrap_or(OPENTOFU_RELEASES).to_string();
        let releases: Vec<GithubRelease> = self
            .index
            .get(format!("{url}?per_page=100"))
            .send()
            .await
            .with_context(|| format!("cannot fetch release index from {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("unexpected github releases payload")?;

        let mut result: Vec<Release> = releases
            .into_iter()
            .map(|r| {
                let version = r.tag_name.trim_start_matches('v').to_string();
                let shasums_url = r
                    .assets
                    .iter()
                    .find(|a| a.name.ends_with("SHA256SUMS"))
                    .map(|a| a.browser_download_url.clone());
                let platforms = r
                    .assets
                    .iter()
                    .filter_map(|a| parse_zip_asset(&version, &a.name, &a.browser_download_url))
                    .collect();
                Release {
                    version,
                    prerelease: r.prerelease,
                    release_date: r.published_at,
                    platforms,
                    shasums_url,
                }
            })
            .collect();
        crate::semver::sort_descending(&mut result, |r| &r.version);
        Ok(result)
    }

    /// Fetch a `SHA256SUMS` document into filename → hex digest.
    pub async fn fetch_shasums(&self, url: &str) -> Result<std::collections::HashMap<String, String>> {
        let body = self
            .index
            .get(url)
            .send()
            .await
            .with_context(|| format!("cannot fetch shasums from {url}"))?
            .error_for_status()?
            .text()
            .await?;
        let mut sums = std::collections::HashMap::new();
        for line in body.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(sha), Some(filename)) = (parts.next(), parts.next()) {
                sums.insert(filename.trim_start_matches('*').to_string(), sha.to_string());
            }
        }
        Ok(sums)
    }

    pub async fn download(&self, url: &str) -> Result<impl tokio::io::AsyncRead + Send + Unpin> {
        use futures::TryStreamExt;
        let response = self
            .download
            .get(url)
            .send()
            .await
            .with_context(|| format!("cannot download binary from {url}"))?
            .error_for_status()
            .with_context(|| format!("binary download rejected from {url}"))?;
        Ok(tokio_util::io::StreamReader::new(
            response.bytes_stream().map_err(std::io::Error::other),
        ))
    }
}

/// Parse `tofu_1.6.0_linux_amd64.zip`-style asset names.
fn parse_zip_asset(version: &str, name: &str, url: &str) -> Option<ReleasePlatform> {
    let suffix = name.strip_suffix(".zip")?;
    let rest = suffix.strip_prefix(&format!("tofu_{version}_"))?;
    let (os, arch) = rest.split_once('_')?;
    Some(ReleasePlatform {
        os: os.to_string(),
        arch: arch.to_string(),
        filename: name.to_string(),
        url: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zip_asset() {
        let platform = parse_zip_asset(
            "1.6.0",
            "tofu_1.6.0_linux_amd64.zip",
            "https://example.com/tofu.zip",
        )
        .unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.arch, "amd64");

        assert!(parse_zip_asset("1.6.0", "tofu_1.6.0_SHA256SUMS", "u").is_none());
        assert!(parse_zip_asset("1.6.0", "tofu_1.7.0_linux_amd64.zip", "u").is_none());
    }
}
