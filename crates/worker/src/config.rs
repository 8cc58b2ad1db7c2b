use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rooper_cloud::address::Addressing;
use rooper_cloud::storage::S3Settings;
use rooper_comfyui::readiness::ReadinessPolicy;
use rooper_comfyui::tracker::TrackerConfig;
use rooper_core::retry::RetryPolicy;
use rooper_core::template::{FixedParams, WorkflowBindings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration, read once at startup and shared immutably.
///
/// Storage settings may be incomplete; that only fails the upload step
/// of each job, not startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job intake bind address (default: `0.0.0.0`).
    pub host: String,
    /// Job intake port (default: `8000`).
    pub port: u16,
    /// ComfyUI base URL.
    pub comfyui_url: String,
    /// ComfyUI install root; asset directories are relative to it.
    pub comfyui_root: PathBuf,
    /// API-format workflow loaded for every job.
    pub workflow_template: PathBuf,
    pub readiness: ReadinessPolicy,
    pub tracker: TrackerConfig,
    pub bindings: WorkflowBindings,
    pub fixed_params: FixedParams,
    /// Published objects are named `{prefix}_{prompt_id}.{ext}`.
    pub object_key_prefix: String,
    pub storage: S3Settings,
    pub addressing: Addressing,
    pub upload_retry: RetryPolicy,
    /// JSON asset list replacing the built-in manifest.
    pub asset_manifest: Option<PathBuf>,
    pub civitai_token: Option<String>,
    pub skip_asset_provisioning: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                       |
    /// |----------------------------|-------------------------------|
    /// | `HOST`                     | `0.0.0.0`                     |
    /// | `PORT`                     | `8000`                        |
    /// | `COMFYUI_URL`              | `http://127.0.0.1:8188`       |
    /// | `COMFYUI_ROOT`             | `/comfyui`                    |
    /// | `COMFYUI_OUTPUT_DIR`       | `$COMFYUI_ROOT/output`        |
    /// | `WORKFLOW_TEMPLATE`        | `workflows/wan_i2v_api.json`  |
    /// | `READINESS_MAX_ATTEMPTS`   | `30`                          |
    /// | `READINESS_INTERVAL_MS`    | `1000`                        |
    /// | `POLL_INTERVAL_MS`         | `1000`                        |
    /// | `POLL_TIMEOUT_SECS`        | `1800` (`0` disables)         |
    /// | `OBJECT_KEY_PREFIX`        | `rooper`                      |
    /// | `UPLOAD_MAX_ATTEMPTS`      | `3`                           |
    /// | `BUCKET_REGION`            | `auto`                        |
    /// | `SKIP_ASSET_PROVISIONING`  | `false`                       |
    ///
    /// `BUCKET_ENDPOINT_URL`, `BUCKET_NAME`, `BUCKET_ACCESS_KEY_ID`,
    /// `BUCKET_SECRET_ACCESS_KEY`, `BUCKET_PUBLIC_URL`, `ASSET_MANIFEST`
    /// and `CIVITAI_TOKEN` have no default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let comfyui_root = PathBuf::from(get("COMFYUI_ROOT").unwrap_or_else(|| "/comfyui".into()));
        let output_dir = get("COMFYUI_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| comfyui_root.join("output"));

        let poll_timeout_secs: u64 = parse(&get, "POLL_TIMEOUT_SECS", 1800)?;
        let endpoint_url = get("BUCKET_ENDPOINT_URL");
        let bucket = get("BUCKET_NAME");

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "PORT", 8000)?,
            comfyui_url: get("COMFYUI_URL").unwrap_or_else(|| "http://127.0.0.1:8188".into()),
            workflow_template: PathBuf::from(
                get("WORKFLOW_TEMPLATE").unwrap_or_else(|| "workflows/wan_i2v_api.json".into()),
            ),
            readiness: ReadinessPolicy {
                max_attempts: parse(&get, "READINESS_MAX_ATTEMPTS", 30)?,
                interval: Duration::from_millis(parse(&get, "READINESS_INTERVAL_MS", 1000)?),
            },
            tracker: TrackerConfig {
                poll_interval: Duration::from_millis(parse(&get, "POLL_INTERVAL_MS", 1000)?),
                poll_timeout: (poll_timeout_secs > 0)
                    .then(|| Duration::from_secs(poll_timeout_secs)),
                output_dir,
            },
            bindings: WorkflowBindings::default(),
            fixed_params: FixedParams::default(),
            object_key_prefix: get("OBJECT_KEY_PREFIX").unwrap_or_else(|| "rooper".into()),
            storage: S3Settings {
                endpoint_url: endpoint_url.clone(),
                bucket: bucket.clone(),
                access_key_id: get("BUCKET_ACCESS_KEY_ID"),
                secret_access_key: get("BUCKET_SECRET_ACCESS_KEY"),
                region: get("BUCKET_REGION"),
            },
            addressing: Addressing {
                public_base_url: get("BUCKET_PUBLIC_URL"),
                endpoint_url,
                bucket,
            },
            upload_retry: RetryPolicy {
                max_attempts: parse(&get, "UPLOAD_MAX_ATTEMPTS", 3)?,
                ..Default::default()
            },
            asset_manifest: get("ASSET_MANIFEST").map(PathBuf::from),
            civitai_token: get("CIVITAI_TOKEN"),
            skip_asset_provisioning: parse(&get, "SKIP_ASSET_PROVISIONING", false)?,
            comfyui_root,
        })
    }

    /// Object key for an artifact produced by `prompt_id`.
    pub fn object_key(&self, prompt_id: &str, extension: Option<&str>) -> String {
        format!(
            "{}_{}.{}",
            self.object_key_prefix,
            prompt_id,
            extension.unwrap_or("mp4")
        )
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
