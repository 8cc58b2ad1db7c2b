//! Model asset provisioning.
//!
//! Ensures the model weights the job template depends on exist on the
//! local volume before the first job runs. Presence of the target file
//! is the only existence check; nothing is hashed. Each asset is handled
//! independently so a failed transfer never blocks the others, and a
//! later run simply picks up whatever is still missing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Host whose download URLs need an API token appended.
const CIVITAI_HOST: &str = "civitai.com";

/// Default wall-clock limit for a single asset transfer.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A remote file that must exist locally at `directory/filename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub url: String,
    pub directory: PathBuf,
    pub filename: String,
}

impl AssetSpec {
    pub fn new(url: impl Into<String>, directory: impl Into<PathBuf>, filename: &str) -> Self {
        Self {
            url: url.into(),
            directory: directory.into(),
            filename: filename.to_string(),
        }
    }

    /// Full local path of the asset.
    pub fn local_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

/// What happened to one asset during a provisioning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    /// The file was already on disk; nothing was transferred.
    AlreadyPresent,
    /// The file was missing and has been downloaded.
    Downloaded,
    /// The file was missing and could not be fetched.
    Failed(String),
}

/// Per-asset result of [`provision`].
#[derive(Debug, Clone)]
pub struct AssetReport {
    pub asset: AssetSpec,
    pub outcome: AssetOutcome,
}

impl AssetReport {
    pub fn is_available(&self) -> bool {
        !matches!(self.outcome, AssetOutcome::Failed(_))
    }
}

/// Errors from a single asset transfer.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Downloader exited with code {exit_code}: {stderr}")]
    ExitStatus { exit_code: i32, stderr: String },

    #[error("Download timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("Downloader finished but {0} does not exist")]
    MissingOutput(PathBuf),
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// Transfers one remote asset to its local path.
///
/// Implementations may assume the target directory already exists.
pub trait Downloader: Send + Sync {
    fn download(
        &self,
        asset: &AssetSpec,
    ) -> impl Future<Output = Result<(), DownloadError>> + Send;
}

/// Parallel-segment downloader backed by the `aria2c` binary.
#[derive(Debug, Clone)]
pub struct Aria2Downloader {
    /// Maximum connections per server (`-x`).
    pub connections: u16,
    /// Number of segments (`-s`).
    pub split: u16,
    /// Minimum segment size (`-k`).
    pub min_split_size: String,
    pub timeout: Duration,
}

impl Default for Aria2Downloader {
    fn default() -> Self {
        Self {
            connections: 16,
            split: 16,
            min_split_size: "1M".to_string(),
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

impl Aria2Downloader {
    fn args(&self, asset: &AssetSpec) -> Vec<String> {
        vec![
            "-x".to_string(),
            self.connections.to_string(),
            "-s".to_string(),
            self.split.to_string(),
            "-k".to_string(),
            self.min_split_size.clone(),
            "-d".to_string(),
            asset.directory.to_string_lossy().into_owned(),
            "-o".to_string(),
            asset.filename.clone(),
            asset.url.clone(),
        ]
    }
}

impl Downloader for Aria2Downloader {
    async fn download(&self, asset: &AssetSpec) -> Result<(), DownloadError> {
        let start = Instant::now();

        // `kill_on_drop(true)` kills aria2c if the timeout fires.
        let child = Command::new("aria2c")
            .args(self.args(asset))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DownloadError::Io {
                path: asset.local_path(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(DownloadError::Io {
                    path: asset.local_path(),
                    source,
                })
            }
            Err(_elapsed) => {
                return Err(DownloadError::Timeout {
                    elapsed_secs: start.elapsed().as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(DownloadError::ExitStatus {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let path = asset.local_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(DownloadError::MissingOutput(path));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Make sure every asset exists locally, fetching the missing ones.
///
/// Never fails as a whole: each asset gets its own [`AssetReport`] and
/// the caller decides whether partial availability is acceptable.
pub async fn provision<D: Downloader>(assets: &[AssetSpec], downloader: &D) -> Vec<AssetReport> {
    let mut reports = Vec::with_capacity(assets.len());

    for asset in assets {
        let outcome = ensure_one(asset, downloader).await;
        match &outcome {
            AssetOutcome::AlreadyPresent => {
                tracing::info!(file = %asset.filename, "Found asset, skipping download");
            }
            AssetOutcome::Downloaded => {
                tracing::info!(file = %asset.filename, "Finished downloading asset");
            }
            AssetOutcome::Failed(reason) => {
                tracing::error!(file = %asset.filename, error = %reason, "Failed to download asset");
            }
        }
        reports.push(AssetReport {
            asset: asset.clone(),
            outcome,
        });
    }

    reports
}

async fn ensure_one<D: Downloader>(asset: &AssetSpec, downloader: &D) -> AssetOutcome {
    let path = asset.local_path();
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return AssetOutcome::AlreadyPresent;
    }

    if let Err(e) = tokio::fs::create_dir_all(&asset.directory).await {
        return AssetOutcome::Failed(
            DownloadError::Io {
                path: asset.directory.clone(),
                source: e,
            }
            .to_string(),
        );
    }

    tracing::info!(file = %asset.filename, url = %redact_query(&asset.url), "Downloading asset");
    match downloader.download(asset).await {
        Ok(()) => AssetOutcome::Downloaded,
        Err(e) => AssetOutcome::Failed(e.to_string()),
    }
}

/// Drop the query string so API tokens never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The models the Wan image-to-video template loads, rooted at `root`.
///
/// `civitai_token` is appended to civitai.com URLs, which refuse
/// anonymous downloads.
pub fn default_manifest(root: &Path, civitai_token: Option<&str>) -> Vec<AssetSpec> {
    let assets = [
        (
            "https://huggingface.co/Comfy-Org/Wan_2.1_ComfyUI_repackaged/resolve/main/split_files/text_encoders/umt5_xxl_fp8_e4m3fn_scaled.safetensors",
            "models/clip",
            "umt5_xxl_fp8_e4m3fn_scaled.safetensors",
        ),
        (
            "https://huggingface.co/Comfy-Org/Wan_2.1_ComfyUI_repackaged/resolve/main/split_files/vae/wan_2.1_vae.safetensors",
            "models/vae",
            "wan_2.1_vae.safetensors",
        ),
        (
            "https://civitai.com/api/download/models/2260110",
            "models/unet",
            "smoothMixWan22I2VT2V_i2vHigh.safetensors",
        ),
        (
            "https://civitai.com/api/download/models/2259006",
            "models/unet",
            "smoothMixWan22I2VT2V_i2vLow.safetensors",
        ),
    ];

    assets
        .into_iter()
        .map(|(url, dir, filename)| {
            AssetSpec::new(with_token(url, civitai_token), root.join(dir), filename)
        })
        .collect()
}

fn with_token(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() && url.contains(CIVITAI_HOST) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}token={token}")
        }
        _ => url.to_string(),
    }
}

/// Load a JSON array of [`AssetSpec`] from `path`.
///
/// Relative asset directories are resolved against `root`.
pub async fn load_manifest(path: &Path, root: &Path) -> Result<Vec<AssetSpec>, DownloadError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let assets: Vec<AssetSpec> =
        serde_json::from_str(&raw).map_err(|e| DownloadError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

    Ok(assets
        .into_iter()
        .map(|mut asset| {
            if asset.directory.is_relative() {
                asset.directory = root.join(&asset.directory);
            }
            asset
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
