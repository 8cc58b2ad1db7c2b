//! Public address derivation for uploaded objects.
//!
//! Two schemes, tried in order:
//!
//! 1. A configured public base URL (CDN or bucket custom domain) joined
//!    with the object key.
//! 2. A virtual-hosted-style URL built from the storage endpoint and
//!    bucket: `https://{bucket}.{endpoint-host}/{key}`. An endpoint that
//!    already carries the bucket as its first path segment has that
//!    segment stripped first.

use reqwest::Url;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("No public URL configured and no storage endpoint/bucket to derive one from")]
    Unconfigured,

    #[error("Invalid storage endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Settings that determine how object URLs are built.
#[derive(Debug, Clone, Default)]
pub struct Addressing {
    pub public_base_url: Option<String>,
    pub endpoint_url: Option<String>,
    pub bucket: Option<String>,
}

impl Addressing {
    /// Externally reachable URL for `key`.
    pub fn object_url(&self, key: &str) -> Result<String, AddressError> {
        let key = key.trim_start_matches('/');

        if let Some(base) = non_empty(self.public_base_url.as_deref()) {
            return Ok(format!("{}/{key}", base.trim_end_matches('/')));
        }

        match (
            non_empty(self.endpoint_url.as_deref()),
            non_empty(self.bucket.as_deref()),
        ) {
            (Some(endpoint), Some(bucket)) => virtual_hosted_url(endpoint, bucket, key),
            _ => Err(AddressError::Unconfigured),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn virtual_hosted_url(endpoint: &str, bucket: &str, key: &str) -> Result<String, AddressError> {
    let invalid = |reason: &str| AddressError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

    let host = if host.starts_with(&format!("{bucket}.")) {
        host.to_string()
    } else {
        format!("{bucket}.{host}")
    };
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };

    let prefix = remaining_path(&url, bucket);
    Ok(format!("{}://{authority}{prefix}/{key}", url.scheme()))
}

/// Endpoint path with a leading bucket segment removed, no trailing slash.
fn remaining_path(url: &Url, bucket: &str) -> String {
    let mut segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    if segments.first() == Some(&bucket) {
        segments.remove(0);
    }
    segments.iter().map(|seg| format!("/{seg}")).collect()
}

/// Endpoint suitable for the S3 client: the configured endpoint with a
/// trailing bucket path segment removed.
pub fn client_endpoint(endpoint: &str, bucket: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) => {
            let authority = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => return endpoint.trim_end_matches('/').to_string(),
            };
            format!("{}://{authority}{}", url.scheme(), remaining_path(&url, bucket))
        }
        Err(_) => endpoint.trim_end_matches('/').to_string(),
    }
}
