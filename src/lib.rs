//! Ingot library — content-addressed blob storage with a repository/path
//! namespace.
//!
//! This crate provides the core components for running the Ingot server:
//! the content-addressed blob store, the durable namespace index, the
//! upload coordinator, and the HTTP request handlers that tie them
//! together.

pub mod blobstore;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod index;
pub mod metrics;
pub mod server;
pub mod upload;

use crate::config::Config;
use crate::upload::UploadService;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Upload coordinator owning the blob store and namespace index.
    pub service: UploadService,
}
