//! # Bootstrap Configuration
//!
//! Minimal process configuration loaded before the database is reachable.
//!
//! Everything else (storage backends, OIDC, SCM providers, mirrors) lives in
//! the database and is managed through the API after the setup wizard
//! completes. The bootstrap file only carries what is needed to get there:
//! the database connection, the listen address, and the externally visible
//! base URL.
//!
//! Environment variables override file values: `DATABASE_URL`, `LISTEN_ADDR`,
//! `BASE_URL`, `DEV_MODE`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DATABASE_URL, DEFAULT_LISTEN_ADDR};

/// Process bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Database connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Externally visible base URL, used in signed proxy URLs and webhook URLs
    #[serde(default)]
    pub base_url: Option<String>,
    /// Trust `X-Forwarded-For` when attributing client addresses.
    ///
    /// Only enable behind a reverse proxy that strips and rewrites the
    /// header; otherwise any caller can spoof the address the rate limiter
    /// keys on. Off by default, which uses the peer socket address.
    #[serde(default)]
    pub trust_proxy_headers: bool,
    /// Enable the dev-mode impersonation header (never enable in production)
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            listen_addr: default_listen_addr(),
            base_url: None,
            trust_proxy_headers: false,
            dev_mode: false,
        }
    }
}

impl BootstrapConfig {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => Self::default(),
        };

        if let Ok(v) = std::env::var("DATABASE_URL") {
            config.database_url = v;
        }
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = std::env::var("BASE_URL") {
            config.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("TRUST_PROXY_HEADERS") {
            config.trust_proxy_headers = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("DEV_MODE") {
            config.dev_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }

    /// Base URL with any trailing slash removed, defaulting to the listen
    /// address for single-host deployments.
    pub fn external_base_url(&self) -> String {
        let raw = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.listen_addr));
        raw.trim_end_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BootstrapConfig::default();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(!config.dev_mode);
        assert!(!config.trust_proxy_headers);
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "database_url: sqlite://test.db\nbase_url: https://registry.example.com/"
        )
        .unwrap();
        let config = BootstrapConfig::load(Some(f.path())).unwrap();
        assert_eq!(config.database_url, "sqlite://test.db");
        assert_eq!(
            config.external_base_url(),
            "https://registry.example.com"
        );
    }
}
