//! Submission and completion tracking for a single bound job.
//!
//! The tracker posts the workflow, then polls `/history/{prompt_id}` on a
//! fixed interval until the prompt id shows up as a key. Transport errors
//! while polling count as "not finished yet". The wait ends early only on
//! the configured deadline or the caller's [`CancellationToken`]; in both
//! cases the prompt is removed from the server's queue on a best-effort
//! basis.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rooper_core::template::BoundJob;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::outputs::{resolve_output, HistoryEntry, OutputFile, OutputKind};

/// Message used when a finished prompt produced nothing publishable.
pub const NO_OUTPUT_MESSAGE: &str = "No output video found";

/// Server-assigned identifier correlating a submission with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self(prompt_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Polling and output-location settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// Give up waiting after this long. `None` waits indefinitely.
    pub poll_timeout: Option<Duration>,
    /// Directory the server writes its outputs to.
    pub output_dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_timeout: Some(Duration::from_secs(30 * 60)),
            output_dir: PathBuf::from("/comfyui/output"),
        }
    }
}

/// Result of a job that ran to completion and produced an artifact.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub handle: JobHandle,
    pub kind: OutputKind,
    pub artifact: OutputFile,
    /// Where the artifact lives on the local volume.
    pub local_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Failed to queue workflow: {0}")]
    Submission(#[source] ComfyUIApiError),

    #[error("Timed out after {elapsed_secs}s waiting for prompt {prompt_id}")]
    PollTimeout { prompt_id: String, elapsed_secs: u64 },

    #[error("Cancelled while waiting for prompt {0}")]
    Cancelled(String),

    #[error("{msg}", msg = NO_OUTPUT_MESSAGE)]
    NoOutput { prompt_id: String },
}

/// Drives one bound job through the rendering service.
pub struct JobExecutionTracker<'a> {
    api: &'a ComfyUIApi,
    config: &'a TrackerConfig,
}

impl<'a> JobExecutionTracker<'a> {
    pub fn new(api: &'a ComfyUIApi, config: &'a TrackerConfig) -> Self {
        Self { api, config }
    }

    /// Submit, wait for completion, and resolve the produced artifact.
    pub async fn execute(
        &self,
        job: &BoundJob,
        cancel: &CancellationToken,
    ) -> Result<CompletedJob, TrackerError> {
        let handle = self.submit(job).await?;
        let entry = self.wait_for_completion(&handle, cancel).await?;

        let candidate = resolve_output(&entry.outputs).ok_or_else(|| TrackerError::NoOutput {
            prompt_id: handle.to_string(),
        })?;
        // `resolve_output` only returns candidates that carry a file.
        let artifact = candidate.file.ok_or_else(|| TrackerError::NoOutput {
            prompt_id: handle.to_string(),
        })?;

        let local_path = artifact.local_path(&self.config.output_dir);
        tracing::info!(
            prompt_id = %handle,
            node_id = %candidate.node_id,
            kind = ?candidate.kind,
            path = %local_path.display(),
            "Resolved job output",
        );

        Ok(CompletedJob {
            handle,
            kind: candidate.kind,
            artifact,
            local_path,
        })
    }

    /// Queue the job and return its handle.
    pub async fn submit(&self, job: &BoundJob) -> Result<JobHandle, TrackerError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .api
            .submit_workflow(job.as_value(), &client_id)
            .await
            .map_err(TrackerError::Submission)?;

        if response
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            tracing::warn!(
                prompt_id = %response.prompt_id,
                node_errors = %response.node_errors,
                "ComfyUI accepted prompt with node errors",
            );
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(JobHandle::new(response.prompt_id))
    }

    /// Block until the handle appears in the history registry.
    ///
    /// Completion is presence of the key; an engine-side render error is
    /// logged but still counts as complete.
    pub async fn wait_for_completion(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<HistoryEntry, TrackerError> {
        let start = Instant::now();

        let bounded_poll = async {
            match self.config.poll_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.poll_until_present(handle))
                    .await
                    .map_err(|_| TrackerError::PollTimeout {
                        prompt_id: handle.to_string(),
                        elapsed_secs: start.elapsed().as_secs(),
                    }),
                None => Ok(self.poll_until_present(handle).await),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TrackerError::Cancelled(handle.to_string())),
            result = bounded_poll => result,
        };

        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(prompt_id = %handle, error = %e, "Abandoning prompt");
                self.abandon(handle).await;
                return Err(e);
            }
        };

        let entry = serde_json::from_value::<HistoryEntry>(raw).unwrap_or_else(|e| {
            tracing::warn!(prompt_id = %handle, error = %e, "Unreadable history entry");
            HistoryEntry::default()
        });

        if entry.reported_error() {
            tracing::warn!(prompt_id = %handle, "ComfyUI reported an execution error");
        }
        tracing::info!(
            prompt_id = %handle,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prompt finished",
        );
        Ok(entry)
    }

    async fn poll_until_present(&self, handle: &JobHandle) -> serde_json::Value {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.api.get_history(handle.as_str()).await {
                Ok(mut history) => {
                    if let Some(entry) = history.remove(handle.as_str()) {
                        return entry;
                    }
                }
                Err(e) => {
                    tracing::debug!(prompt_id = %handle, attempt, error = %e, "History poll failed");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Best-effort removal of a prompt the caller stopped waiting for.
    async fn abandon(&self, handle: &JobHandle) {
        if let Err(e) = self.api.cancel_execution(handle.as_str()).await {
            tracing::debug!(prompt_id = %handle, error = %e, "Failed to dequeue prompt");
        }
        if let Err(e) = self.api.interrupt().await {
            tracing::debug!(prompt_id = %handle, error = %e, "Failed to interrupt prompt");
        }
    }
}
