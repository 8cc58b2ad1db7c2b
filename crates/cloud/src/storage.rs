//! Object storage abstraction and its S3-compatible backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;

use crate::address::client_endpoint;

/// Region used when none is configured. R2 and most S3-compatible
/// services accept `auto`.
pub const DEFAULT_REGION: &str = "auto";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Required connection settings are absent.
    #[error("Storage is not configured: missing {0}")]
    MissingCredentials(&'static str),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The request never got a response (connect, timeout, dispatch).
    #[error("Storage transport error: {0}")]
    Transport(String),

    /// The service answered with an error (access denied, no such bucket, ...).
    #[error("Storage rejected upload: {0}")]
    Rejected(String),
}

impl StorageError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Destination for published artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `local_path` under `key`.
    async fn put_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub endpoint_url: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

impl S3Settings {
    /// First required setting that is absent or blank.
    fn missing(&self) -> Option<&'static str> {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        if blank(&self.bucket) {
            Some("bucket name")
        } else if blank(&self.access_key_id) {
            Some("access key id")
        } else if blank(&self.secret_access_key) {
            Some("secret access key")
        } else {
            None
        }
    }
}

enum Backend {
    Ready {
        client: aws_sdk_s3::Client,
        bucket: String,
    },
    /// Settings were incomplete; every upload fails with this reason.
    Unconfigured(&'static str),
}

/// [`ObjectStore`] backed by `aws-sdk-s3` with static credentials.
pub struct S3ObjectStore {
    backend: Backend,
}

impl S3ObjectStore {
    /// Build a client from `settings`.
    ///
    /// Incomplete settings do not fail here: the store is still created
    /// and reports [`StorageError::MissingCredentials`] on each upload.
    pub async fn connect(settings: &S3Settings) -> Self {
        if let Some(missing) = settings.missing() {
            tracing::warn!(missing, "Object storage is not fully configured");
            return Self {
                backend: Backend::Unconfigured(missing),
            };
        }

        // `missing()` returned None, so these are all present.
        let bucket = settings.bucket.clone().unwrap_or_default();
        let credentials = Credentials::new(
            settings.access_key_id.clone().unwrap_or_default(),
            settings.secret_access_key.clone().unwrap_or_default(),
            None,
            None,
            "rooper-env",
        );
        let region = settings
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials)
            // Retrying is the publisher's job.
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = settings.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(client_endpoint(endpoint, &bucket));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        tracing::info!(bucket = %bucket, "Object storage client ready");
        Self {
            backend: Backend::Ready {
                client: aws_sdk_s3::Client::from_conf(s3_config),
                bucket,
            },
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let (client, bucket) = match &self.backend {
            Backend::Ready { client, bucket } => (client, bucket),
            Backend::Unconfigured(missing) => {
                return Err(StorageError::MissingCredentials(*missing))
            }
        };

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Io {
                path: local_path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;

        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let detail = DisplayErrorContext(&e).to_string();
                if matches!(e, SdkError::ServiceError(_)) {
                    StorageError::Rejected(detail)
                } else {
                    StorageError::Transport(detail)
                }
            })?;

        Ok(())
    }
}
