//! Bulk-storage abstraction (C6, §4.6).
//!
//! The directory (C3) never touches bytes directly; every byte-level
//! operation — creating a version, running a chunked upload, reading a
//! range, deleting — goes through [`backend::StorageBackend`]. Three
//! implementations share the trait: a crash-only local filesystem
//! backend, an S3 gateway backend, and a prioritized overlay composite.
//! [`memory`] is an in-process fake used by handler/lifecycle tests.

pub mod backend;
pub mod filesystem;
pub mod memory;
pub mod overlay;
pub mod s3;
