//! Result publication to S3-compatible object storage.
//!
//! [`storage`] holds the object-store abstraction and its S3 backend,
//! [`address`] derives the public URL of an uploaded object, and
//! [`publisher`] ties the two together behind a bounded retry policy.

pub mod address;
pub mod publisher;
pub mod storage;
