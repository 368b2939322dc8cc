//! # Storage Backends
//!
//! Pluggable object storage behind a small capability trait.
//!
//! Backends register a factory under a short name (`local`, `s3`, `azure`,
//! `gcs`); the active database configuration selects one. Handlers hold a
//! [`LazyStorage`] rather than a backend directly, so the process can start
//! (and the setup wizard can run) before any storage config exists; the
//! first signed-URL request initializes the backend on demand.

pub mod azure;
pub mod gcs;
pub mod local;
pub mod s3;
pub mod signer;

use std::collections::HashMap;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::Database;
use signer::UrlSigner;

/// Byte stream handed back by [`StorageBackend::download`].
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidKey(String),
    #[error("storage backend is not configured")]
    NotConfigured,
    #[error("invalid storage configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

/// Result of a completed upload.
#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub path: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Uniform object-store capability implemented by every backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short factory name (`local`, `s3`, `azure`, `gcs`), recorded on
    /// version rows as `storage_backend`.
    fn name(&self) -> &'static str;

    /// Store the stream under `path`, computing SHA-256 in transit.
    async fn upload(&self, path: &str, reader: ObjectReader) -> Result<UploadInfo, StorageError>;

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError>;

    /// Time-limited URL authorizing a single GET without storage credentials.
    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Exercise authentication and the network path without writing state.
    async fn readiness_probe(&self) -> Result<(), StorageError> {
        self.exists(crate::constants::READINESS_PROBE_KEY).await?;
        Ok(())
    }
}

/// Context handed to backend factories.
#[derive(Clone)]
pub struct BackendInit {
    /// Raw settings JSON from the active storage config row. Sealed fields
    /// are decrypted by the factory, never earlier.
    pub settings: serde_json::Value,
    pub cipher: TokenCipher,
    pub signer: UrlSigner,
}

impl std::fmt::Debug for BackendInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInit").finish_non_exhaustive()
    }
}

impl BackendInit {
    /// Decrypt an optional sealed field from the settings blob.
    pub fn open_secret(&self, sealed: Option<&str>) -> Result<Option<String>, StorageError> {
        match sealed {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => self
                .cipher
                .open(s)
                .map(Some)
                .map_err(|e| StorageError::Config(format!("cannot decrypt secret: {e}"))),
        }
    }
}

pub type BackendFactory =
    Arc<dyn Fn(BackendInit) -> BoxFuture<'static, Result<Arc<dyn StorageBackend>, StorageError>> + Send + Sync>;

/// Factory registry. The process-wide instance is populated at init and
/// treated as read-only afterwards; tests construct their own and inject it.
#[derive(Default)]
pub struct BackendRegistry {
    factories: RwLock<HashMap<&'static str, BackendFactory>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry").finish_non_exhaustive()
    }
}

static GLOBAL_REGISTRY: LazyLock<BackendRegistry> = LazyLock::new(|| {
    let registry = BackendRegistry::default();
    registry.register_builtin();
    registry
});

impl BackendRegistry {
    pub fn global() -> &'static BackendRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn register(&self, name: &'static str, factory: BackendFactory) {
        self.factories
            .write()
            .expect("backend registry lock poisoned")
            .insert(name, factory);
    }

    /// Register the built-in backends.
    pub fn register_builtin(&self) {
        self.register(
            "local",
            Arc::new(|init| Box::pin(async move { local::LocalBackend::from_init(init) })),
        );
        self.register(
            "s3",
            Arc::new(|init| Box::pin(async move { s3::S3Backend::from_init(init).await })),
        );
        self.register(
            "azure",
            Arc::new(|init| Box::pin(async move { azure::AzureBackend::from_init(init) })),
        );
        self.register(
            "gcs",
            Arc::new(|init| Box::pin(async move { gcs::GcsBackend::from_init(init).await })),
        );
    }

    pub async fn create(
        &self,
        backend_type: &str,
        init: BackendInit,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let factory = self
            .factories
            .read()
            .expect("backend registry lock poisoned")
            .get(backend_type)
            .cloned()
            .ok_or_else(|| {
                StorageError::Config(format!("unknown storage backend type {backend_type:?}"))
            })?;
        factory(init).await
    }
}

/// Lazily initialized handle to the active backend.
///
/// Re-reads the active storage config when the cached backend was built from
/// a different config row, so activating a new config takes effect without a
/// restart.
pub struct LazyStorage {
    db: Database,
    registry: &'static BackendRegistry,
    cipher: TokenCipher,
    signer: UrlSigner,
    cached: tokio::sync::RwLock<Option<(Uuid, Arc<dyn StorageBackend>)>>,
}

impl std::fmt::Debug for LazyStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyStorage").finish_non_exhaustive()
    }
}

impl LazyStorage {
    pub fn new(db: Database, registry: &'static BackendRegistry, cipher: TokenCipher, signer: UrlSigner) -> Self {
        Self {
            db,
            registry,
            cipher,
            signer,
            cached: tokio::sync::RwLock::new(None),
        }
    }

    /// Active backend, constructing it on first use. Returns
    /// [`StorageError::NotConfigured`] until a storage config is activated.
    pub async fn get(&self) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let config = self
            .db
            .settings()
            .get_active_storage_config()
            .await
            .map_err(|e| StorageError::Backend(format!("cannot read storage config: {e}")))?
            .ok_or(StorageError::NotConfigured)?;

        if let Some((id, backend)) = self.cached.read().await.as_ref() {
            if *id == config.id {
                return Ok(Arc::clone(backend));
            }
        }

        let settings: serde_json::Value = serde_json::from_str(&config.settings)
            .map_err(|e| StorageError::Config(format!("bad settings json: {e}")))?;
        let backend = self
            .registry
            .create(
                &config.backend_type,
                BackendInit {
                    settings,
                    cipher: self.cipher.clone(),
                    signer: self.signer.clone(),
                },
            )
            .await?;
        tracing::info!(backend = backend.name(), config_id = %config.id, "storage backend initialized");
        *self.cached.write().await = Some((config.id, Arc::clone(&backend)));
        Ok(backend)
    }

    /// Drop the cached backend; the next call re-reads the active config.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

/// Spool an incoming stream to a temp file, hashing in transit.
///
/// Uploads go through here so every backend can retry, size, and label the
/// object without re-reading the caller's stream.
pub(crate) async fn spool_to_temp(
    mut reader: ObjectReader,
) -> Result<(tempfile::NamedTempFile, u64, String), StorageError> {
    let mut file = tempfile::NamedTempFile::new()?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        size += n as u64;
    }
    file.flush()?;
    Ok((file, size, hex::encode(hasher.finalize())))
}

/// Key containing `..`, a leading slash, or empty segments is rejected on
/// every backend, not only the local one.
pub(crate) fn validate_key(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || path.starts_with('/') {
        return Err(StorageError::InvalidKey(format!("invalid object key {path:?}")));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(StorageError::InvalidKey(format!("invalid object key {path:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spool_hashes_content() {
        let data = b"terraform registry".to_vec();
        let reader: ObjectReader = Box::pin(std::io::Cursor::new(data.clone()));
        let (_file, size, sha) = spool_to_temp(reader).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(sha, hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("modules/ns/name/sys/a.tar.gz").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }
}
