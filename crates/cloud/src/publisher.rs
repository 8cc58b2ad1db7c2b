//! Uploads a finished artifact and returns its public URL.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rooper_core::retry::{retry_with_backoff, RetryPolicy};

use crate::address::{AddressError, Addressing};
use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload failed: {0}")]
    Address(#[from] AddressError),
}

/// Publishes local artifacts to object storage.
pub struct ResultPublisher {
    store: Arc<dyn ObjectStore>,
    addressing: Addressing,
    retry: RetryPolicy,
}

impl ResultPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, addressing: Addressing, retry: RetryPolicy) -> Self {
        Self {
            store,
            addressing,
            retry,
        }
    }

    /// Upload `local_path` under `key` and return the object's URL.
    ///
    /// Transport errors are retried per the configured policy; missing
    /// credentials and service rejections fail on the first attempt.
    /// Addressing is resolved first, so a missing public base uploads
    /// nothing.
    pub async fn publish(&self, local_path: &Path, key: &str) -> Result<String, PublishError> {
        let url = self.addressing.object_url(key)?;
        let content_type = content_type_for(local_path);
        let start = Instant::now();

        retry_with_backoff(&self.retry, StorageError::is_retryable, |attempt| {
            tracing::debug!(key, attempt, "Uploading artifact");
            self.store.put_file(local_path, key, content_type)
        })
        .await?;

        tracing::info!(
            key,
            url = %url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Artifact published",
        );
        Ok(url)
    }
}

/// MIME type for the artifact formats the video-combine node emits.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;

    /// Replays scripted results, then succeeds.
    #[derive(Default)]
    struct ScriptedStore {
        results: Mutex<VecDeque<Result<(), StorageError>>>,
        uploads: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedStore {
        fn failing_with(errors: Vec<StorageError>) -> Self {
            Self {
                results: Mutex::new(errors.into_iter().map(Err).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        async fn put_file(
            &self,
            _local_path: &Path,
            key: &str,
            content_type: &str,
        ) -> Result<(), StorageError> {
            self.uploads
                .lock()
                .unwrap()
                .push((key.to_string(), content_type.to_string()));
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn addressing() -> Addressing {
        Addressing {
            public_base_url: Some("https://cdn.example.com".into()),
            ..Default::default()
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn publish_returns_public_url() {
        let store = Arc::new(ScriptedStore::default());
        let publisher = ResultPublisher::new(store.clone(), addressing(), fast_retry(3));

        let url = publisher
            .publish(Path::new("/comfyui/output/out.mp4"), "rooper_p1.mp4")
            .await
            .unwrap();

        assert_eq!(url, "https://cdn.example.com/rooper_p1.mp4");
        assert_eq!(
            *store.uploads.lock().unwrap(),
            vec![("rooper_p1.mp4".to_string(), "video/mp4".to_string())]
        );
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let store = Arc::new(ScriptedStore::failing_with(vec![
            StorageError::Transport("connection reset".into()),
            StorageError::Transport("timeout".into()),
        ]));
        let publisher = ResultPublisher::new(store.clone(), addressing(), fast_retry(3));

        assert!(publisher.publish(Path::new("a.mp4"), "a.mp4").await.is_ok());
        assert_eq!(store.uploads.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_credentials_fail_fast() {
        let store = Arc::new(ScriptedStore::failing_with(vec![
            StorageError::MissingCredentials("access key id"),
        ]));
        let publisher = ResultPublisher::new(store.clone(), addressing(), fast_retry(3));

        let err = publisher.publish(Path::new("a.mp4"), "a.mp4").await.unwrap_err();
        assert_matches!(err, PublishError::Storage(StorageError::MissingCredentials(_)));
        assert_eq!(store.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let store = Arc::new(ScriptedStore::failing_with(vec![
            StorageError::Transport("1".into()),
            StorageError::Transport("2".into()),
        ]));
        let publisher = ResultPublisher::new(store.clone(), addressing(), fast_retry(2));

        let err = publisher.publish(Path::new("a.mp4"), "a.mp4").await.unwrap_err();
        assert_eq!(err.to_string(), "Upload failed: Storage transport error: 2");
    }

    #[tokio::test]
    async fn unconfigured_addressing_fails_before_uploading() {
        let store = Arc::new(ScriptedStore::default());
        let publisher = ResultPublisher::new(store.clone(), Addressing::default(), fast_retry(1));

        let err = publisher.publish(Path::new("a.mp4"), "a.mp4").await.unwrap_err();
        assert_matches!(err, PublishError::Address(AddressError::Unconfigured));
        assert!(store.uploads.lock().unwrap().is_empty());
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(Path::new("x.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("x.gif")), "image/gif");
        assert_eq!(content_type_for(Path::new("x")), "application/octet-stream");
    }
}
