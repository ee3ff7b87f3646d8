//! Cloud sync
//!
//! Uploads a finished archive to a remote store. Sync is additive: its
//! outcome lands in the record's cloud fields and never changes whether
//! the local backup counts as completed. Providers also list, download
//! and delete the archives they hold, so a lost backup directory can be
//! restored from the remote copy.
//!
//! - `CloudAuth`: credentials invalid and not refreshable, re-authorize
//! - `CloudUpload`: network, quota or timeout, safe to retry
//! - `CloudRequest`: list, download or delete failed, safe to retry

pub mod google_drive;
pub mod s3;
pub mod token;

pub use google_drive::{DriveStatus, GoogleDriveProvider};
pub use s3::S3Provider;
pub use token::{OAuthTokens, TokenStore};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::{BackupConfig, CloudProviderKind};

/// Where an uploaded archive lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteObject {
    pub provider: String,
    /// Provider's own identifier (file id, object key)
    pub id: String,
    /// Displayable location stored on the record
    pub path: String,
}

/// Archive held by a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteBackup {
    /// Provider's own identifier, passed back to `download` and `delete`
    pub id: String,
    pub name: String,
    /// Same form as `RemoteObject::path`, so it matches `cloud_path`
    pub path: String,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("cloud authorization failed: {0}")]
    Auth(String),

    #[error("cloud upload failed: {0}")]
    Upload(String),

    #[error("cloud provider not configured: {0}")]
    NotConfigured(String),

    #[error("cloud request failed: {0}")]
    Request(String),

    #[error("remote backup not found: {0}")]
    NotFound(String),
}

impl CloudError {
    pub fn code(&self) -> &'static str {
        match self {
            CloudError::Auth(_) => "NEXUS_CLOUD_AUTH",
            CloudError::Upload(_) => "NEXUS_CLOUD_UPLOAD",
            CloudError::NotConfigured(_) => "NEXUS_CLOUD_NOT_CONFIGURED",
            CloudError::Request(_) => "NEXUS_CLOUD_REQUEST",
            CloudError::NotFound(_) => "NEXUS_CLOUD_NOT_FOUND",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Upload(_) | CloudError::Request(_))
    }

    pub(crate) fn request(err: reqwest::Error) -> Self {
        CloudError::Request(err.to_string())
    }

    /// Error for a non-success response: 401/403 need re-authorization,
    /// 404 means the object is gone, anything else goes to `fallback`
    pub(crate) fn from_status(
        status: StatusCode,
        message: String,
        fallback: fn(String) -> CloudError,
    ) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
            StatusCode::NOT_FOUND => CloudError::NotFound(message),
            _ => fallback(message),
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        CloudError::Upload(err.to_string())
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upload `path` as `remote_name`
    async fn upload(&self, path: &Path, remote_name: &str) -> CloudResult<RemoteObject>;

    /// Archives held remotely, newest first
    async fn list(&self) -> CloudResult<Vec<RemoteBackup>>;

    /// Write the object to `dest`; returns the bytes written
    async fn download(&self, remote_id: &str, dest: &Path) -> CloudResult<u64>;

    async fn delete(&self, remote_id: &str) -> CloudResult<()>;

    /// Cheapest authenticated call the provider offers
    async fn test_connection(&self) -> CloudResult<()> {
        self.list().await.map(|_| ())
    }
}

/// Provider plus the per-attempt timeout
#[derive(Clone)]
pub struct CloudSyncAdapter {
    provider: Arc<dyn CloudProvider>,
    timeout: Duration,
}

impl CloudSyncAdapter {
    pub fn new(provider: Arc<dyn CloudProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    /// One upload attempt; a timeout is a retryable upload error
    pub async fn sync(&self, path: &Path) -> CloudResult<RemoteObject> {
        let remote_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CloudError::Upload(format!("not a file: {}", path.display())))?;

        match tokio::time::timeout(self.timeout, self.provider.upload(path, &remote_name)).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Upload(format!(
                "upload timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Adapter for the configured provider, if any
pub fn adapter_from_config(config: &BackupConfig) -> CloudResult<Option<CloudSyncAdapter>> {
    let timeout = Duration::from_secs(config.cloud.upload_timeout_secs);
    let provider: Arc<dyn CloudProvider> = match config.cloud.provider {
        None => return Ok(None),
        Some(CloudProviderKind::GoogleDrive) => Arc::new(GoogleDriveProvider::new(
            config.cloud.google_drive.clone(),
            TokenStore::new(config.token_path()),
        )?),
        Some(CloudProviderKind::S3) => Arc::new(S3Provider::new(config.cloud.s3.clone())?),
    };
    Ok(Some(CloudSyncAdapter::new(provider, timeout)))
}

/// Stream a successful response body into `dest`, creating or
/// truncating it. A partial file is removed on error.
pub(crate) async fn write_body(mut response: reqwest::Response, dest: &Path) -> CloudResult<u64> {
    let write_error =
        |e: std::io::Error| CloudError::Request(format!("cannot write {}: {}", dest.display(), e));
    let mut file = tokio::fs::File::create(dest).await.map_err(write_error)?;

    let mut written = 0u64;
    let result = async {
        while let Some(chunk) = response.chunk().await.map_err(CloudError::request)? {
            file.write_all(&chunk).await.map_err(write_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)
    }
    .await;

    if let Err(e) = result {
        drop(file);
        let _ = tokio::fs::remove_file(dest).await;
        return Err(e);
    }
    Ok(written)
}

pub(crate) fn http_client() -> CloudResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("nexus-backup/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CloudError::NotConfigured(format!("HTTP client: {}", e)))
}
