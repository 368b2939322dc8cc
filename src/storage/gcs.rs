//! Google Cloud Storage backend.
//!
//! Authenticates with a service-account JSON from the settings blob, or the
//! application-default chain (ADC / Workload Identity) when none is given.
//! Download URLs are V4 signed URLs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::Error as GcsHttpError;
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use super::{
    spool_to_temp, validate_key, BackendInit, ObjectMetadata, ObjectReader, StorageBackend,
    StorageError, UploadInfo,
};

const SHA256_METADATA_KEY: &str = "sha256";

#[derive(Debug, Clone, Deserialize)]
pub struct GcsSettings {
    pub bucket: String,
    /// Service-account JSON, sealed by the token cipher. Absent means ADC.
    #[serde(default)]
    pub credentials_json_encrypted: Option<String>,
}

pub struct GcsBackend {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend").field("bucket", &self.bucket).finish_non_exhaustive()
    }
}

impl GcsBackend {
    pub async fn from_init(init: BackendInit) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let settings: GcsSettings = serde_json::from_value(init.settings.clone())
            .map_err(|e| StorageError::Config(format!("bad gcs settings: {e}")))?;
        if settings.bucket.is_empty() {
            return Err(StorageError::Config("bucket is required".to_string()));
        }

        let config = match init.open_secret(settings.credentials_json_encrypted.as_deref())? {
            Some(json) => {
                let credentials = CredentialsFile::new_from_str(&json)
                    .await
                    .map_err(|e| StorageError::Config(format!("bad gcs credentials: {e}")))?;
                ClientConfig::default()
                    .with_credentials(credentials)
                    .await
                    .map_err(|e| StorageError::Config(format!("gcs auth failed: {e}")))?
            }
            None => ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| StorageError::Config(format!("gcs default auth failed: {e}")))?,
        };

        Ok(Arc::new(Self {
            client: Client::new(config),
            bucket: settings.bucket,
        }))
    }

    fn map_err(path: &str, err: GcsHttpError) -> StorageError {
        if let GcsHttpError::Response(resp) = &err {
            if resp.code == 404 {
                return StorageError::NotFound(path.to_string());
            }
        }
        StorageError::Backend(format!("gcs request failed: {err}"))
    }
}

#[async_trait::async_trait]
impl StorageBackend for GcsBackend {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn upload(&self, path: &str, reader: ObjectReader) -> Result<UploadInfo, StorageError> {
        validate_key(path)?;
        let (temp, size, sha256) = spool_to_temp(reader).await?;
        let mut file = tokio::fs::File::open(temp.path()).await?;
        let mut body = Vec::with_capacity(size as usize);
        file.read_to_end(&mut body).await?;

        let object = Object {
            name: path.to_string(),
            metadata: Some(HashMap::from([(
                SHA256_METADATA_KEY.to_string(),
                sha256.clone(),
            )])),
            ..Default::default()
        };
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                body,
                &UploadType::Multipart(Box::new(object)),
            )
            .await
            .map_err(|e| Self::map_err(path, e))?;

        Ok(UploadInfo {
            path: path.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        validate_key(path)?;
        let stream = self
            .client
            .download_streamed_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: path.to_string(),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(Box::pin(StreamReader::new(
            stream.map_err(std::io::Error::other),
        )))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_key(path)?;
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_key(path)?;
        match self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::map_err(path, e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        validate_key(path)?;
        let object = self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: path.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Self::map_err(path, e))?;

        let sha256 = object
            .metadata
            .as_ref()
            .and_then(|m| m.get(SHA256_METADATA_KEY))
            .cloned();
        let last_modified = object
            .updated
            .and_then(|t| chrono::DateTime::from_timestamp(t.unix_timestamp(), 0));
        Ok(ObjectMetadata {
            path: path.to_string(),
            size: object.size.max(0) as u64,
            sha256,
            last_modified,
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        self.client
            .signed_url(
                &self.bucket,
                path,
                None,
                None,
                SignedURLOptions {
                    method: SignedURLMethod::GET,
                    expires: ttl,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StorageError::Backend(format!("gcs signed url failed: {e}")))
    }
}
