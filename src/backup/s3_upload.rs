// dbbackup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use log::info;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::S3StorageConfig;
use crate::errors::{AppError, Result, Stage};

/// Uploads a finished archive somewhere off the machine. Never touches the local file.
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn upload(&self, archive_path: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Uploads to an S3-compatible object storage service (AWS, DigitalOcean Spaces, MinIO...).
#[derive(Debug, Clone)]
pub struct S3Sink {
    config: S3StorageConfig,
}

impl S3Sink {
    pub fn new(config: S3StorageConfig) -> Self {
        Self { config }
    }

    async fn client(&self) -> s3::Client {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&self.config.endpoint_url)
            .region(Region::new(self.config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.config.access_key_id,
                &self.config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;
        s3::Client::new(&sdk_config)
    }

    async fn put_archive(&self, archive_path: &Path, key: &str) -> Result<()> {
        let client = self.client().await;

        let body = ByteStream::from_path(archive_path).await.map_err(|e| {
            AppError::Upload(format!(
                "Failed to read archive {} for upload: {}",
                archive_path.display(),
                e
            ))
        })?;

        client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::Upload(format!(
                    "Failed to upload file {} to S3 bucket {} with key {}: {}",
                    archive_path.display(),
                    self.config.bucket_name,
                    key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

#[async_trait]
impl BackupSink for S3Sink {
    async fn upload(&self, archive_path: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(Stage::Upload));
        }

        let key = object_key(self.config.folder_prefix.as_deref(), archive_path)?;
        info!(
            "Uploading {} to S3 bucket {} with key {}...",
            archive_path.display(),
            self.config.bucket_name,
            key
        );

        tokio::select! {
            result = self.put_archive(archive_path, &key) => result?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled(Stage::Upload)),
        }

        info!(
            "✅ Successfully uploaded {} to S3 bucket {} with key {}",
            archive_path.display(),
            self.config.bucket_name,
            key
        );
        Ok(())
    }
}

/// `prefix/file_name`, tolerating stray slashes in the prefix.
fn object_key(folder_prefix: Option<&str>, archive_path: &Path) -> Result<String> {
    let file_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            AppError::Upload(format!("Invalid archive path: {}", archive_path.display()))
        })?;

    match folder_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => Ok(format!("{}/{}", prefix, file_name)),
        None => Ok(file_name.to_string()),
    }
}
