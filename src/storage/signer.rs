//! HMAC signer for file-proxy download URLs.
//!
//! The local backend (and any deployment without a natively signing object
//! store) issues URLs of the form
//! `<base>/files/<key>?expires=<unix>&signature=<hex>`; the file-proxy
//! endpoint verifies them here before streaming bytes.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct UrlSigner {
    key: [u8; 32],
    base_url: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(key: [u8; 32], base_url: impl Into<String>) -> Self {
        Self {
            key,
            base_url: base_url.into(),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Signed proxy URL for an object key.
    pub fn sign(&self, path: &str, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = hex::encode(self.mac(path, expires));
        format!(
            "{}/files/{}?expires={}&signature={}",
            self.base_url, path, expires, signature
        )
    }

    /// Check signature and expiry for an incoming proxy request.
    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let expected = self.mac(path, expires);
        expected.ct_eq(&provided).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new([7u8; 32], "http://localhost:8080")
    }

    #[test]
    fn test_sign_and_verify() {
        let s = signer();
        let url = s.sign("modules/a/b/c/x.tar.gz", Duration::from_secs(3600));
        let query = url.split('?').nth(1).unwrap();
        let mut expires = 0i64;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v.parse().unwrap(),
                "signature" => sig = v.to_string(),
                _ => {}
            }
        }
        assert!(s.verify("modules/a/b/c/x.tar.gz", expires, &sig));
        // Wrong path, expired stamp, and tampered signature all fail.
        assert!(!s.verify("modules/a/b/c/other.tar.gz", expires, &sig));
        assert!(!s.verify("modules/a/b/c/x.tar.gz", 1, &sig));
        let mut bad = sig.clone();
        bad.replace_range(0..1, if sig.starts_with('0') { "1" } else { "0" });
        assert!(!s.verify("modules/a/b/c/x.tar.gz", expires, &bad));
    }
}
