//! Inbound job request, outbound envelope, and input image decoding.
//!
//! A job arrives as `{"input": {"image": "<base64>", "duration": 4.0}}`
//! and always leaves as either `{"status": "success", "video_url": ...}`
//! or `{"error": ...}`.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Clip duration (seconds) used when the request omits `duration`.
pub const DEFAULT_DURATION_SECS: f64 = 4.0;

/// Message returned when the request carries no image payload.
pub const NO_IMAGE_MESSAGE: &str = "No image provided";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A job as delivered by the serverless queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    /// Queue-assigned job identifier, if the queue provides one.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

/// Caller-supplied parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    /// Base64 image, optionally prefixed with a `data:<mime>;base64,` header.
    #[serde(default)]
    pub image: Option<String>,
    /// Requested clip duration in seconds.
    #[serde(default = "default_duration")]
    pub duration: f64,
}

fn default_duration() -> f64 {
    DEFAULT_DURATION_SECS
}

impl Default for JobInput {
    fn default() -> Self {
        Self {
            image: None,
            duration: DEFAULT_DURATION_SECS,
        }
    }
}

impl JobInput {
    /// Check required fields before any network activity happens.
    ///
    /// Returns the raw image payload on success.
    pub fn validate(&self) -> Result<&str, CoreError> {
        let image = match self.image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() => image,
            _ => return Err(CoreError::Validation(NO_IMAGE_MESSAGE.to_string())),
        };

        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(CoreError::Validation(format!(
                "Duration must be a positive number, got {}",
                self.duration
            )));
        }

        Ok(image)
    }
}

// ---------------------------------------------------------------------------
// Image payload decoding
// ---------------------------------------------------------------------------

/// Decoded input image ready for upload to the rendering service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    /// File extension derived from the data-URI mime type or magic bytes.
    pub extension: &'static str,
}

/// Decode a base64 image, stripping an optional data-URI header.
pub fn decode_image(payload: &str) -> Result<ImagePayload, CoreError> {
    let (mime, encoded) = split_data_uri(payload.trim());

    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| CoreError::Validation(format!("Image is not valid base64: {e}")))?;

    if bytes.is_empty() {
        return Err(CoreError::Validation("Image payload is empty".to_string()));
    }

    let extension = mime
        .and_then(extension_for_mime)
        .unwrap_or_else(|| sniff_extension(&bytes));

    Ok(ImagePayload { bytes, extension })
}

/// Split `data:image/png;base64,AAAA` into (`Some("image/png")`, `"AAAA"`).
fn split_data_uri(payload: &str) -> (Option<&str>, &str) {
    let Some(rest) = payload.strip_prefix("data:") else {
        return (None, payload);
    };
    match rest.split_once(',') {
        Some((header, data)) => {
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            (mime, data)
        }
        None => (None, payload),
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime.to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "png"
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Error,
}

/// Terminal value of one job invocation.
///
/// Exactly one of `artifact_remote_url` / `error_detail` is populated.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub status: JobStatus,
    pub artifact_local_path: Option<PathBuf>,
    pub artifact_remote_url: Option<String>,
    pub error_detail: Option<String>,
}

impl JobResult {
    pub fn success(local_path: PathBuf, remote_url: String) -> Self {
        Self {
            status: JobStatus::Success,
            artifact_local_path: Some(local_path),
            artifact_remote_url: Some(remote_url),
            error_detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            artifact_local_path: None,
            artifact_remote_url: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// Convert into the wire envelope returned to the caller.
    pub fn into_response(self) -> JobResponse {
        match (self.status, self.artifact_remote_url) {
            (JobStatus::Success, Some(video_url)) => JobResponse::Success {
                status: "success",
                video_url,
            },
            (_, _) => JobResponse::Failure {
                error: self
                    .error_detail
                    .unwrap_or_else(|| "Unknown error".to_string()),
            },
        }
    }
}

/// Wire envelope: `{"status": "success", "video_url": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobResponse {
    Success {
        status: &'static str,
        video_url: String,
    },
    Failure {
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
