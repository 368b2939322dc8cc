//! S3-compatible backend.
//!
//! Credentials resolve in order: static keys from the settings blob,
//! STS AssumeRole chaining, then the SDK default chain (which covers
//! web-identity federation via `AWS_WEB_IDENTITY_TOKEN_FILE` /
//! `AWS_ROLE_ARN`, instance profiles, and shared config).

use std::sync::Arc;
use std::time::Duration;

use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;

use super::{
    spool_to_temp, validate_key, BackendInit, ObjectMetadata, ObjectReader, StorageBackend,
    StorageError, UploadInfo,
};

/// Reserved per-object metadata key carrying the hex SHA-256.
const SHA256_METADATA_KEY: &str = "sha256";

#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Sealed by the token cipher.
    #[serde(default)]
    pub secret_access_key_encrypted: Option<String>,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub use_path_style: bool,
}

pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend").field("bucket", &self.bucket).finish_non_exhaustive()
    }
}

impl S3Backend {
    pub async fn from_init(init: BackendInit) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let settings: S3Settings = serde_json::from_value(init.settings.clone())
            .map_err(|e| StorageError::Config(format!("bad s3 settings: {e}")))?;
        if settings.bucket.is_empty() {
            return Err(StorageError::Config("bucket is required".to_string()));
        }

        let secret_key = init.open_secret(settings.secret_access_key_encrypted.as_deref())?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(Region::new(region));
        }
        if let (Some(access_key), Some(secret)) = (settings.access_key_id.clone(), secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret,
                None,
                None,
                "registry-static",
            ));
        }
        let mut config = loader.load().await;

        if let Some(role_arn) = settings.role_arn.clone() {
            let provider = AssumeRoleProvider::builder(role_arn)
                .session_name("terraform-registry")
                .configure(&config)
                .build()
                .await;
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .credentials_provider(provider);
            if let Some(region) = settings.region.clone() {
                loader = loader.region(Region::new(region));
            }
            config = loader.load().await;
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&config);
        if let Some(endpoint) = settings.endpoint.clone() {
            builder = builder.endpoint_url(endpoint);
        }
        if settings.use_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Arc::new(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: settings.bucket,
        }))
    }
}

#[async_trait::async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, path: &str, reader: ObjectReader) -> Result<UploadInfo, StorageError> {
        validate_key(path)?;
        let (temp, size, sha256) = spool_to_temp(reader).await?;
        let body = ByteStream::from_path(temp.path())
            .await
            .map_err(|e| StorageError::Backend(format!("cannot read spooled upload: {e}")))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .metadata(SHA256_METADATA_KEY, &sha256)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("s3 put_object failed: {e}")))?;
        Ok(UploadInfo {
            path: path.to_string(),
            size,
            sha256,
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        validate_key(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StorageError::NotFound(path.to_string())
                } else {
                    StorageError::Backend(format!("s3 get_object failed: {service}"))
                }
            })?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_key(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("s3 delete_object failed: {e}")))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_key(path)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(format!("s3 head_object failed: {service}")))
                }
            }
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMetadata, StorageError> {
        validate_key(path)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    StorageError::NotFound(path.to_string())
                } else {
                    StorageError::Backend(format!("s3 head_object failed: {service}"))
                }
            })?;

        let sha256 = head
            .metadata()
            .and_then(|m| m.get(SHA256_METADATA_KEY))
            .cloned();
        let last_modified = head
            .last_modified()
            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0));
        Ok(ObjectMetadata {
            path: path.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            sha256,
            last_modified,
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Backend(format!("bad presign ttl: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Backend(format!("s3 presign failed: {e}")))?;
        Ok(presigned.uri().to_string())
    }
}
