//! Readiness gate for the rendering service.
//!
//! ComfyUI is started alongside the worker and takes a while to bind its
//! port. Jobs wait here until a probe gets any HTTP response back, with a
//! fixed attempt budget and a fixed interval between attempts.

use std::future::Future;
use std::time::Duration;

use crate::api::ComfyUIApi;

/// Something that can tell whether the rendering service is reachable.
pub trait ReadinessProbe: Send + Sync {
    fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

impl ReadinessProbe for ComfyUIApi {
    async fn is_reachable(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    api_url = %self.api_url(),
                    connect = e.is_connect(),
                    error = %e,
                    "ComfyUI not reachable yet",
                );
                false
            }
        }
    }
}

/// Attempt budget for [`wait_until_ready`].
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// Probe until the service answers or the attempt budget is spent.
///
/// Returns `false` after `max_attempts` failed probes, each followed by
/// one `interval` of sleep. Callers treat `false` as a fatal job error.
pub async fn wait_until_ready<P: ReadinessProbe>(probe: &P, policy: &ReadinessPolicy) -> bool {
    for attempt in 1..=policy.max_attempts {
        if probe.is_reachable().await {
            tracing::debug!(attempt, "Rendering service is reachable");
            return true;
        }
        tracing::debug!(
            attempt,
            max_attempts = policy.max_attempts,
            "Waiting for rendering service",
        );
        tokio::time::sleep(policy.interval).await;
    }

    tracing::error!(
        max_attempts = policy.max_attempts,
        "Rendering service did not become reachable",
    );
    false
}
