//! Azure Blob Storage backend.
//!
//! Authenticates with a SharedKey or a pre-issued SAS token. When `cdn_url`
//! is configured, download URLs point at the CDN without signing; otherwise
//! a read-only blob SAS is generated per request.

use std::sync::Arc;
use std::time::Duration;

use azure_core::request_options::Metadata;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::{
    spool_to_temp, validate_key, BackendInit, ObjectMetadata, ObjectReader, StorageBackend,
    StorageError, UploadInfo,
};

const SHA256_METADATA_KEY: &str = "sha256";

/// Upload block size; blobs larger than one block go through the block list.
const BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct AzureSettings {
    pub account: String,
    pub container: String,
    /// Sealed by the token cipher.
    #[serde(default)]
    pub access_key_encrypted: Option<String>,
    /// Sealed by the token cipher; used when no access key is present.
    #[serde(default)]
    pub sas_token_encrypted: Option<String>,
    #[serde(default)]
    pub cdn_url: Option<String>,
}

pub struct AzureBackend {
    container: ContainerClient,
    container_name: String,
    cdn_url: Option<String>,
}

impl std::fmt::Debug for AzureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBackend")
            .field("container", &self.container_name)
            .finish_non_exhaustive()
    }
}

impl AzureBackend {
    pub fn from_init(init: BackendInit) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let settings: AzureSettings = serde_json::from_value(init.settings.clone())
            .map_err(|e| StorageError::Config(format!("bad azure settings: {e}")))?;
        if settings.account.is_empty() || settings.container.is_empty() {
            return Err(StorageError::Config(
                "account and container are required".to_string(),
            ));
        }

        let credentials = if let Some(key) = init.open_secret(settings.access_key_encrypted.as_deref())? {
            StorageCredentials::access_key(settings.account.clone(), key)
        } else if let Some(sas) = init.open_secret(settings.sas_token_encrypted.as_deref())? {
            StorageCredentials::sas_token(sas)
                .map_err(|e| StorageError::Config(format!("bad sas token: {e}")))?
        } else {
            return Err(StorageError::Config(
                "either access key or sas token is required".to_string(),
            ));
        };

        let service = BlobServiceClient::new(settings.account.clone(), credentials);
        Ok(Arc::new(Self {
            container: service.container_client(settings.container.clone()),
            container_name: settings.container,
            cdn_url: settings.cdn_url,
        }))
    }

    fn blob(&self, path: &str) -> BlobClient {
        self.container.blob_client(path)
    }
}

fn map_azure_err(path: &str, err: azure_core::Error) -> StorageError {
    if let Some(http) = err.as_http_error() {
        if http.status() == azure_core::StatusCode::NotFound {
            return StorageError::NotFound(path.to_string());
        }
    }
    StorageError::Backend(format!("azure blob request failed: {err}"))
}

#[async_trait::async_trait]
impl StorageBackend for AzureBackend {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn upload(&self, path: &str, reader: ObjectReader) -> Result<UploadInfo, StorageError> {
        validate_key(path)?;
        let (temp, size, sha256) = spool_to_temp(reader).await?;
        let blob = self.blob(path);

        let mut metadata = Metadata::new();
        metadata.insert(SHA256_METADATA_KEY, sha256.clone());

        let mut file = tokio::fs::File::open(temp.path()).await?;
        let mut block_list = BlockList::default();
        let mut index: u32 = 0;
        loop {
            let mut chunk = vec![0u8; BLOCK_SIZE];
            let mut filled = 0;
            while filled < BLOCK_SIZE {
                let n = file.read(&mut chunk[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);
            let block_id = format!("{index:08}");
            blob.put_block(block_id.clone(), Bytes::from(chunk))
                .await
                .map_err(|e| map_azure_err(path, e))?;
            block_list
                .blocks
                .push(BlobBlockType::new_uncommitted(block_id));
            index += 1;
        }

        blob.put_block_list(block_list)
            .metadata(metadata)
            .await
            .map_err(|e| map_azure_err(path, e))?;

        Ok(UploadInfo {
            path: path.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        validate_key(path)?;
        let content = self
            .blob(path)
            .get_content()
            .await
            .map_err(|e| map_azure_err(path, e))?;
        Ok(Box::pin(std::io::Cursor::new(content)))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_key(path)?;
        self.blob(path)
            .delete()
            .await
            .map_err(|e| map_azure_err(path, e))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_key(path)?;
        self.blob(path)
            .exists()
            .await
            .map_err(|e| map_azure_err(path, e))
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        validate_key(path)?;
        let properties = self
            .blob(path)
            .get_properties()
            .await
            .map_err(|e| map_azure_err(path, e))?;

        let sha256 = properties
            .blob
            .metadata
            .as_ref()
            .and_then(|m| m.get(SHA256_METADATA_KEY))
            .cloned();
        let last_modified = chrono::DateTime::from_timestamp(
            properties.blob.properties.last_modified.unix_timestamp(),
            0,
        );
        Ok(ObjectMetadata {
            path: path.to_string(),
            size: properties.blob.properties.content_length,
            sha256,
            last_modified,
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        if let Some(cdn) = &self.cdn_url {
            return Ok(format!(
                "{}/{}/{}",
                cdn.trim_end_matches('/'),
                self.container_name,
                path
            ));
        }
        let blob = self.blob(path);
        let expiry =
            time::OffsetDateTime::now_utc() + time::Duration::seconds(ttl.as_secs() as i64);
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };
        let sas = blob
            .shared_access_signature(permissions, expiry)
            .await
            .map_err(|e| StorageError::Backend(format!("azure sas generation failed: {e}")))?;
        let url = blob
            .generate_signed_blob_url(&sas)
            .map_err(|e| StorageError::Backend(format!("azure signed url failed: {e}")))?;
        Ok(url.to_string())
    }
}
