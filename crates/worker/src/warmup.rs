//! One-time asset provisioning before the worker accepts jobs.

use rooper_core::assets::{
    default_manifest, load_manifest, provision, AssetReport, AssetSpec, DownloadError, Downloader,
};

use crate::config::WorkerConfig;

/// Resolve the asset list: the manifest file when configured, otherwise
/// the built-in model set.
pub async fn manifest_for(config: &WorkerConfig) -> Result<Vec<AssetSpec>, DownloadError> {
    match &config.asset_manifest {
        Some(path) => load_manifest(path, &config.comfyui_root).await,
        None => Ok(default_manifest(
            &config.comfyui_root,
            config.civitai_token.as_deref(),
        )),
    }
}

/// Provision every asset and log a summary.
///
/// Returns an empty report when provisioning is disabled. A manifest that
/// cannot be read is logged and treated as empty; the worker still serves.
pub async fn provision_assets<D: Downloader>(
    config: &WorkerConfig,
    downloader: &D,
) -> Vec<AssetReport> {
    if config.skip_asset_provisioning {
        tracing::info!("Asset provisioning disabled");
        return Vec::new();
    }

    let assets = match manifest_for(config).await {
        Ok(assets) => assets,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load asset manifest");
            return Vec::new();
        }
    };

    let reports = provision(&assets, downloader).await;
    let missing = reports.iter().filter(|r| !r.is_available()).count();
    if missing > 0 {
        tracing::warn!(
            total = reports.len(),
            missing,
            "Asset provisioning incomplete; jobs needing missing models will fail",
        );
    } else {
        tracing::info!(total = reports.len(), "All assets available");
    }
    reports
}
