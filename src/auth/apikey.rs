//! API key generation and verification.
//!
//! Keys look like `tfr_<40 alphanumeric chars>`. The stored prefix narrows
//! authentication to a handful of candidate rows; bcrypt does the actual
//! comparison, so a stolen database never yields usable keys.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::db::api_keys::ApiKey;
use crate::db::Database;

/// Prefix identifying registry API keys in an Authorization header.
pub const KEY_SENTINEL: &str = "tfr_";

/// Stored prefix length (sentinel plus the first characters of the random part).
const PREFIX_LEN: usize = 12;

const RANDOM_LEN: usize = 40;

/// Material for a freshly generated key. The plaintext leaves the process
/// exactly once, in the create/rotate response.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

pub fn generate_key() -> anyhow::Result<GeneratedKey> {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_LEN)
        .map(char::from)
        .collect();
    let plaintext = format!("{KEY_SENTINEL}{random}");
    let prefix = plaintext[..PREFIX_LEN].to_string();
    let hash = hash(&plaintext, DEFAULT_COST)?;
    Ok(GeneratedKey {
        plaintext,
        prefix,
        hash,
    })
}

pub fn looks_like_api_key(token: &str) -> bool {
    token.starts_with(KEY_SENTINEL)
}

/// Resolve a presented plaintext key to its row: candidate lookup by
/// prefix, bcrypt comparison, expiry check, then `last_used_at` touch.
pub async fn authenticate(db: &Database, plaintext: &str) -> Option<ApiKey> {
    if plaintext.len() < PREFIX_LEN {
        return None;
    }
    let prefix = &plaintext[..PREFIX_LEN];
    let candidates = db.api_keys().find_by_prefix(prefix).await.ok()?;
    for key in candidates {
        if !verify(plaintext, &key.key_hash).unwrap_or(false) {
            continue;
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at <= Utc::now() {
                tracing::debug!(key_id = %key.id, "rejected expired api key");
                return None;
            }
        }
        touch_last_used(db, key.id).await;
        return Some(key);
    }
    None
}

async fn touch_last_used(db: &Database, id: Uuid) {
    if let Err(error) = db.api_keys().update_last_used(id).await {
        tracing::warn!(key_id = %id, %error, "failed to update api key last_used_at");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::api_keys::NewApiKey;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_key().unwrap();
        assert!(key.plaintext.starts_with(KEY_SENTINEL));
        assert_eq!(key.plaintext.len(), KEY_SENTINEL.len() + RANDOM_LEN);
        assert_eq!(key.prefix.len(), PREFIX_LEN);
        assert!(key.plaintext.starts_with(&key.prefix));
        assert!(verify(&key.plaintext, &key.hash).unwrap());
        // A changed plaintext never verifies.
        assert!(!verify(&format!("{}x", key.plaintext), &key.hash).unwrap());
    }

    #[tokio::test]
    async fn test_authenticate_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let org = db.organizations().default_org().await.unwrap();
        let generated = generate_key().unwrap();
        let row = db
            .api_keys()
            .create_key(&NewApiKey {
                user_id: None,
                organization_id: org.id,
                name: "ci".to_string(),
                key_hash: generated.hash.clone(),
                key_prefix: generated.prefix.clone(),
                scopes: vec!["modules:write".to_string()],
                expires_at: None,
            })
            .await
            .unwrap();

        let found = authenticate(&db, &generated.plaintext).await.unwrap();
        assert_eq!(found.id, row.id);
        // Authentication touched last_used_at but not the hash.
        let after = db.api_keys().get_by_id(row.id).await.unwrap().unwrap();
        assert!(after.last_used_at.is_some());
        assert_eq!(after.key_hash, generated.hash);

        assert!(authenticate(&db, "tfr_not-a-real-key-000000000000000000").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_key_rejected() {
        let db = Database::in_memory().await.unwrap();
        let org = db.organizations().default_org().await.unwrap();
        let generated = generate_key().unwrap();
        db.api_keys()
            .create_key(&NewApiKey {
                user_id: None,
                organization_id: org.id,
                name: "old".to_string(),
                key_hash: generated.hash.clone(),
                key_prefix: generated.prefix.clone(),
                scopes: vec![],
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            })
            .await
            .unwrap();
        assert!(authenticate(&db, &generated.plaintext).await.is_none());
    }
}
