//! Per-job orchestration: validate, wait for the engine, ingest the
//! image, bind, execute, publish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use rooper_cloud::publisher::{PublishError, ResultPublisher};
use rooper_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use rooper_comfyui::readiness::wait_until_ready;
use rooper_comfyui::tracker::{JobExecutionTracker, TrackerError};
use rooper_core::error::CoreError;
use rooper_core::job::{decode_image, ImagePayload, JobRequest, JobResult};
use rooper_core::template::{bind, build_overlay, JobTemplate, TemplateError};

use crate::config::WorkerConfig;

/// Message returned when the engine never became reachable.
pub const NOT_READY_MESSAGE: &str = "ComfyUI server did not start";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The request itself is unusable. Raised before any network call.
    #[error("{0}")]
    Input(String),

    #[error("{msg}", msg = NOT_READY_MESSAGE)]
    ReadinessTimeout,

    #[error("Failed to upload input image: {0}")]
    Ingest(#[source] ComfyUIApiError),

    #[error("Failed to prepare workflow: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Execution(#[from] TrackerError),

    #[error(transparent)]
    Upload(#[from] PublishError),
}

impl JobError {
    /// Short stage label for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Input(_) => "validation",
            Self::ReadinessTimeout => "readiness",
            Self::Ingest(_) => "ingest",
            Self::Template(_) => "binding",
            Self::Execution(_) => "execution",
            Self::Upload(_) => "publish",
        }
    }
}

impl From<CoreError> for JobError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Input(msg),
        }
    }
}

/// Artifact that made it all the way to object storage.
struct Published {
    local_path: PathBuf,
    url: String,
}

/// Runs jobs against one ComfyUI instance, one at a time.
pub struct JobHandler {
    config: Arc<WorkerConfig>,
    api: ComfyUIApi,
    publisher: ResultPublisher,
    /// ComfyUI holds one model set in VRAM; jobs queue here.
    in_flight: Mutex<()>,
}

impl JobHandler {
    pub fn new(config: Arc<WorkerConfig>, api: ComfyUIApi, publisher: ResultPublisher) -> Self {
        Self {
            config,
            api,
            publisher,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one job to a terminal [`JobResult`]. Never panics, never
    /// returns early without a result.
    pub async fn handle(&self, request: JobRequest, cancel: &CancellationToken) -> JobResult {
        let _slot = self.in_flight.lock().await;

        let job_id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = tracing::info_span!("job", job_id = %job_id);

        async {
            let start = Instant::now();
            tracing::info!(duration = request.input.duration, "Job started");

            match self.run(&request, cancel).await {
                Ok(published) => {
                    self.reclaim().await;
                    tracing::info!(
                        url = %published.url,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Job succeeded",
                    );
                    JobResult::success(published.local_path, published.url)
                }
                Err(e) => {
                    tracing::error!(
                        stage = e.stage(),
                        error = %e,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Job failed",
                    );
                    JobResult::failure(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<Published, JobError> {
        let raw_image = request.input.validate()?;
        let image = decode_image(raw_image)?;

        if !wait_until_ready(&self.api, &self.config.readiness).await {
            return Err(JobError::ReadinessTimeout);
        }

        let image_ref = self.ingest(image).await?;

        let template = JobTemplate::load(&self.config.workflow_template).await?;
        let overlay = build_overlay(
            &self.config.bindings,
            &self.config.fixed_params,
            &image_ref,
            request.input.duration,
        );
        let job = bind(&template, &overlay)?;

        let done = JobExecutionTracker::new(&self.api, &self.config.tracker)
            .execute(&job, cancel)
            .await?;

        let extension = done.artifact.extension();
        let key = self
            .config
            .object_key(done.handle.as_str(), extension.as_deref());
        let url = self.publisher.publish(&done.local_path, &key).await?;

        Ok(Published {
            local_path: done.local_path,
            url,
        })
    }

    /// Upload the decoded image and return the reference `LoadImage`
    /// expects (`subfolder/name` when the server stored it in one).
    async fn ingest(&self, image: ImagePayload) -> Result<String, JobError> {
        let filename = format!("rooper_input_{}.{}", uuid::Uuid::new_v4(), image.extension);
        let mime = match image.extension {
            "jpg" => "image/jpeg",
            "webp" => "image/webp",
            _ => "image/png",
        };

        let stored = self
            .api
            .upload_image(image.bytes, &filename, mime)
            .await
            .map_err(JobError::Ingest)?;
        tracing::debug!(name = %stored.name, subfolder = %stored.subfolder, "Input image uploaded");

        Ok(if stored.subfolder.is_empty() {
            stored.name
        } else {
            format!("{}/{}", stored.subfolder, stored.name)
        })
    }

    /// Ask the engine to release cached memory. Best effort.
    async fn reclaim(&self) {
        if let Err(e) = self.api.free_memory(false).await {
            tracing::warn!(error = %e, "Failed to release engine memory");
        }
    }
}
