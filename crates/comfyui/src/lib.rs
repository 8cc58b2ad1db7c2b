//! ComfyUI REST client and job execution tracking.
//!
//! Provides the HTTP API wrapper, the readiness gate that waits for the
//! server to accept connections, output classification for completed
//! prompts, and the tracker that drives a bound workflow from submission
//! to a resolved artifact.

pub mod api;
pub mod outputs;
pub mod readiness;
pub mod tracker;
