//! Domain logic for the rooper job worker.
//!
//! Nothing in this crate talks to the rendering service or object storage;
//! it holds the job envelope, asset provisioning, template binding, and the
//! retry policy shared by the network-facing crates.

pub mod assets;
pub mod error;
pub mod job;
pub mod retry;
pub mod template;
