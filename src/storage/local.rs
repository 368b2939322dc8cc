//! Local filesystem backend.
//!
//! Objects live under `base_path/<key>` with `0640` files and `0750`
//! directories. Signed URLs point at the registry's file-proxy endpoint
//! unless `serve_directly` is enabled and a reverse proxy serves the tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::{
    spool_to_temp, validate_key, BackendInit, ObjectMetadata, ObjectReader, StorageBackend,
    StorageError, UploadInfo,
};
use crate::storage::signer::UrlSigner;

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    pub base_path: String,
    #[serde(default)]
    pub serve_directly: bool,
    #[serde(default)]
    pub public_base_url: Option<String>,
}

pub struct LocalBackend {
    base_path: PathBuf,
    serve_directly: bool,
    public_base_url: Option<String>,
    signer: UrlSigner,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    pub fn from_init(
        init: BackendInit,
    ) -> Result<std::sync::Arc<dyn StorageBackend>, StorageError> {
        let settings: LocalSettings = serde_json::from_value(init.settings)
            .map_err(|e| StorageError::Config(format!("bad local settings: {e}")))?;
        if settings.base_path.is_empty() {
            return Err(StorageError::Config("base_path is required".to_string()));
        }
        Ok(std::sync::Arc::new(Self {
            base_path: PathBuf::from(settings.base_path),
            serve_directly: settings.serve_directly,
            public_base_url: settings.public_base_url,
            signer: init.signer,
        }))
    }

    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            serve_directly: false,
            public_base_url: None,
            signer,
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                // Walk up to base_path tightening fresh directories.
                let mut dir = parent.to_path_buf();
                while dir.starts_with(&self.base_path) && dir != self.base_path {
                    let perms = std::fs::Permissions::from_mode(0o750);
                    tokio::fs::set_permissions(&dir, perms).await.ok();
                    if !dir.pop() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, path: &str, reader: ObjectReader) -> Result<UploadInfo, StorageError> {
        let target = self.resolve(path)?;
        self.ensure_parent(&target).await?;

        let (temp, size, sha256) = spool_to_temp(reader).await?;
        // Persist via copy: the temp file may live on another filesystem.
        tokio::fs::copy(temp.path(), &target).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o640)).await?;
        }
        Ok(UploadInfo {
            path: path.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        // No per-object metadata store on plain files; recompute.
        let mut file = tokio::fs::File::open(&target).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(ObjectMetadata {
            path: path.to_string(),
            size: meta.len(),
            sha256: Some(hex::encode(hasher.finalize())),
            last_modified: meta.modified().ok().map(chrono::DateTime::from),
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        if self.serve_directly {
            if let Some(base) = &self.public_base_url {
                return Ok(format!("{}/{}", base.trim_end_matches('/'), path));
            }
        }
        Ok(self.signer.sign(path, ttl))
    }

    async fn readiness_probe(&self) -> Result<(), StorageError> {
        // The probe only needs the tree to be reachable.
        tokio::fs::metadata(&self.base_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(dir, UrlSigner::new([1u8; 32], "http://localhost:8080"))
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let data = b"module tarball bytes".to_vec();

        let info = backend
            .upload(
                "modules/ns/name/sys/a-1.0.0.tar.gz",
                Box::pin(std::io::Cursor::new(data.clone())),
            )
            .await
            .unwrap();
        assert_eq!(info.size, data.len() as u64);

        let mut reader = backend
            .download("modules/ns/name/sys/a-1.0.0.tar.gz")
            .await
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        let meta = backend
            .metadata("modules/ns/name/sys/a-1.0.0.tar.gz")
            .await
            .unwrap();
        assert_eq!(meta.sha256.as_deref(), Some(info.sha256.as_str()));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend
            .upload("../escape.bin", Box::pin(std::io::Cursor::new(vec![1u8])))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
        assert!(matches!(
            backend.download("a/../../b").await.err().unwrap(),
            StorageError::InvalidKey(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(matches!(
            backend.download("missing.bin").await.err().unwrap(),
            StorageError::NotFound(_)
        ));
        assert!(!backend.exists("missing.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_signed_url_shape() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let url = backend
            .get_url("modules/a/b/c/x.tar.gz", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:8080/files/modules/a/b/c/x.tar.gz?expires="));
        assert!(url.contains("&signature="));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend
            .upload("a/b.bin", Box::pin(std::io::Cursor::new(vec![1u8, 2])))
            .await
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("a/b.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
