//! The transactional metadata directory (C3, §4.3).
//!
//! Every public operation here is expected to run inside a REPEATABLE
//! READ (or stronger) transaction that re-resolves its resource by id
//! before any ACL check or mutation — the "re-resolve under
//! transaction" pattern from §9. [`sqlite::SqliteDirectory`] is the
//! real implementation; [`memory::MemoryDirectory`] is an in-process
//! fake used by handler- and lifecycle-level tests.

pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::model::{Access, Acl, ChunkRecord, Metadata, ObjectVersion, RoleSet, Subtype, UploadJob};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ErrorKind>> + Send + 'a>>;

/// Identifies which resource an ACL/metadata mutation targets.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    Namespace(&'a str),
    Object(&'a str),
    /// object path, version tag
    Version(&'a str, &'a str),
    /// object path, upload job token
    Upload(&'a str, &'a str),
}

/// What a `delete_name` transaction leaves for the bulk backend to clean
/// up once the transaction has committed (§4.1 "post-commit cleanup
/// closure").
#[derive(Debug, Default)]
pub struct DeleteCleanup {
    pub uploads_to_cancel: Vec<(String, String)>,
    pub versions_to_purge: Vec<(String, String)>,
    pub namespaces_to_purge: Vec<String>,
}

/// Same shape, scoped to deleting a single object or a single version.
#[derive(Debug, Default)]
pub struct VersionDeleteCleanup {
    pub versions_to_purge: Vec<(String, String)>,
}

pub trait MetadataDirectory: Send + Sync + 'static {
    // -- Name model (C1) ---------------------------------------------------
    fn resolve<'a>(&'a self, path: &'a str) -> BoxFut<'a, Option<crate::model::Name>>;

    fn create_name<'a>(
        &'a self,
        path: &'a str,
        subtype: Subtype,
        make_parents: bool,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, crate::model::Name>;

    fn delete_name<'a>(&'a self, path: &'a str, ctx: &'a ClientContext) -> BoxFut<'a, DeleteCleanup>;

    fn enumerate_children<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, Vec<crate::model::Name>>;

    fn enumerate_uploads<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, Vec<UploadJob>>;

    // -- Version lifecycle (C4) --------------------------------------------
    fn enumerate_versions<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, Vec<ObjectVersion>>;

    fn current_version<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, Option<ObjectVersion>>;

    fn get_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, Option<ObjectVersion>>;

    /// Phase (i): insert an invisible row (`version_tag = NULL, is_deleted
    /// = true`), returning its serial id.
    fn create_version<'a>(
        &'a self,
        object_path: &'a str,
        nbytes: u64,
        metadata: Metadata,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, i64>;

    /// Phase (ii): flip the row at `serial_id` to visible with `tag`.
    fn complete_version<'a>(&'a self, serial_id: i64, tag: &'a str) -> BoxFut<'a, ObjectVersion>;

    fn delete_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: Option<&'a str>,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, VersionDeleteCleanup>;

    fn update_metadata_field<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        field: &'a str,
        value: Option<&'a str>,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, ()>;

    // -- Upload / chunk engine (C5) -----------------------------------------
    fn create_upload<'a>(
        &'a self,
        object_path: &'a str,
        job_token: String,
        chunksize: u64,
        nbytes: u64,
        metadata: Metadata,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, UploadJob>;

    fn get_upload<'a>(
        &'a self,
        object_path: &'a str,
        job_token: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, UploadJob>;

    fn put_chunk_record<'a>(&'a self, upload_id: i64, position: u64, aux: String) -> BoxFut<'a, ()>;

    fn get_chunk_records<'a>(&'a self, upload_id: i64) -> BoxFut<'a, Vec<ChunkRecord>>;

    /// Atomically: `create_version` + `complete_version(tag)` +
    /// `delete_upload` (§4.5 "Finalize").
    fn finalize_upload<'a>(
        &'a self,
        upload_id: i64,
        tag: String,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, ObjectVersion>;

    fn cancel_upload<'a>(&'a self, upload_id: i64, ctx: &'a ClientContext) -> BoxFut<'a, ()>;

    // -- ACL engine plumbing (C2) --------------------------------------------
    fn get_acl<'a>(&'a self, resource: ResourceRef<'a>, ctx: &'a ClientContext) -> BoxFut<'a, Acl>;

    fn set_acl_role<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        role: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, ()>;

    fn drop_acl_role<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        role: &'a str,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, ()>;

    fn set_acl<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        roles: RoleSet,
        ctx: &'a ClientContext,
    ) -> BoxFut<'a, ()>;

    // -- Credentials (ambient: feeds `auth`) ---------------------------------
    fn get_credential<'a>(&'a self, client_id: &'a str) -> BoxFut<'a, Option<crate::auth::CredentialRecord>>;

    fn put_credential<'a>(&'a self, record: crate::auth::CredentialRecord) -> BoxFut<'a, ()>;
}
