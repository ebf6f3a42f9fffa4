//! Hatrac — hierarchical, versioned, access-controlled object storage.
//!
//! This crate provides the core components for running a Hatrac service:
//! the name tree and ACL engine, the transactional metadata directory,
//! version lifecycle coordination, the resumable upload/chunk engine,
//! pluggable bulk-storage backends, and the HTTP surface tying them
//! together.

use std::sync::Arc;

pub mod acl;
pub mod auth;
pub mod config;
pub mod context;
pub mod directory;
pub mod errors;
pub mod fingerprint;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod serialization;
pub mod server;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::directory::MetadataDirectory;
use crate::storage::backend::StorageBackend;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The transactional metadata directory (C3).
    pub directory: Arc<dyn MetadataDirectory>,
    /// The bulk-storage backend (C6).
    pub storage: Arc<dyn StorageBackend>,
}
