//! Bearer-JWT verification against the active OIDC configuration.
//!
//! The login dance lives in the identity provider; the registry only
//! validates tokens it is handed. Keys come from the issuer's JWKS document,
//! cached per issuer and refreshed when an unknown `kid` shows up.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::db::settings::OidcConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    kty: String,
}

/// Verifier with a per-issuer JWKS cache.
pub struct JwtVerifier {
    http: reqwest::Client,
    // issuer -> kid -> decoding key
    cache: RwLock<HashMap<String, Arc<HashMap<String, DecodingKey>>>>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl Default for JwtVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl JwtVerifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch_keys(&self, issuer: &str) -> anyhow::Result<Arc<HashMap<String, DecodingKey>>> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: Discovery = self
            .http
            .get(&discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let jwks: Jwks = self
            .http
            .get(&discovery.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut keys = HashMap::new();
        for key in jwks.keys {
            if key.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (key.kid, key.n, key.e) else {
                continue;
            };
            if let Ok(decoding) = DecodingKey::from_rsa_components(&n, &e) {
                keys.insert(kid, decoding);
            }
        }
        let keys = Arc::new(keys);
        self.cache
            .write()
            .await
            .insert(issuer.to_string(), Arc::clone(&keys));
        Ok(keys)
    }

    async fn keys_for(
        &self,
        issuer: &str,
        kid: &str,
    ) -> anyhow::Result<Arc<HashMap<String, DecodingKey>>> {
        if let Some(keys) = self.cache.read().await.get(issuer) {
            if keys.contains_key(kid) {
                return Ok(Arc::clone(keys));
            }
        }
        // Unknown kid: the provider may have rotated; refetch once.
        self.fetch_keys(issuer).await
    }

    /// Validate signature, issuer, audience, and expiry.
    pub async fn verify(&self, token: &str, config: &OidcConfig) -> anyhow::Result<Claims> {
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| anyhow::anyhow!("token header has no kid"))?;
        let keys = self.keys_for(&config.issuer_url, &kid).await?;
        let key = keys
            .get(&kid)
            .ok_or_else(|| anyhow::anyhow!("no jwks key for kid {kid:?}"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[config.client_id.clone()]);
        validation.set_issuer(&[config.issuer_url.trim_end_matches('/')]);
        let data = decode::<Claims>(token, key, &validation)?;
        Ok(data.claims)
    }
}
