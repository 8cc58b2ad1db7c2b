pub mod config;
pub mod handler;
pub mod server;
pub mod warmup;
