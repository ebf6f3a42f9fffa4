//! Core data model (§3): names, object versions, upload jobs, chunk
//! records, and the ACL shape shared by every resource kind.

use std::collections::{BTreeMap, HashSet};

/// The closed metadata key set recognized on objects and versions.
pub const METADATA_KEYS: &[&str] = &[
    "content-type",
    "content-disposition",
    "content-md5",
    "content-sha256",
];

/// Freeform metadata map, restricted at construction time to
/// [`METADATA_KEYS`].
pub type Metadata = BTreeMap<String, String>;

/// Resource subtype for a [`Name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtype {
    Namespace,
    Object,
}

/// Recognized ACL access names, keyed by the resource kind that owns them.
/// Mirrors the table in spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Owner,
    Create,
    Update,
    Read,
    SubtreeOwner,
    SubtreeCreate,
    SubtreeRead,
    SubtreeUpdate,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Owner => "owner",
            Access::Create => "create",
            Access::Update => "update",
            Access::Read => "read",
            Access::SubtreeOwner => "subtree-owner",
            Access::SubtreeCreate => "subtree-create",
            Access::SubtreeRead => "subtree-read",
            Access::SubtreeUpdate => "subtree-update",
        }
    }

    pub fn parse(s: &str) -> Option<Access> {
        match s {
            "owner" => Some(Access::Owner),
            "create" => Some(Access::Create),
            "update" => Some(Access::Update),
            "read" => Some(Access::Read),
            "subtree-owner" => Some(Access::SubtreeOwner),
            "subtree-create" => Some(Access::SubtreeCreate),
            "subtree-read" => Some(Access::SubtreeRead),
            "subtree-update" => Some(Access::SubtreeUpdate),
            _ => None,
        }
    }
}

/// A role set for a single access name on a single resource. Order is
/// insignificant and duplicates collapse (§3 ACL invariants).
pub type RoleSet = HashSet<String>;

/// The full set of direct ACLs carried by one resource, keyed by access
/// name. Only the accesses valid for the resource's kind are populated;
/// direct inheritance lookups are performed separately by [`crate::acl`].
pub type Acl = BTreeMap<Access, RoleSet>;

/// Build an ACL granting full ownership to `owner_id`, matching the
/// "newly created resource gets the caller as owner" rule (§4.1).
pub fn owner_acl(owner_id: &str) -> Acl {
    let mut acl = Acl::new();
    let mut roles = RoleSet::new();
    roles.insert(owner_id.to_string());
    acl.insert(Access::Owner, roles);
    acl
}

/// A node in the name tree (§3 "Name").
#[derive(Debug, Clone)]
pub struct Name {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub ancestors: Vec<i64>,
    pub path: String,
    pub subtype: Subtype,
    pub is_deleted: bool,
    pub acl: Acl,
    pub metadata: Metadata,
}

impl Name {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// An immutable object version (§3 "Object Version").
#[derive(Debug, Clone)]
pub struct ObjectVersion {
    pub id: i64,
    pub object_id: i64,
    /// `None` iff the version is invisible (in-progress or tombstoned).
    pub version_tag: Option<String>,
    pub nbytes: u64,
    pub metadata: Metadata,
    pub is_deleted: bool,
    pub acl: Acl,
}

impl ObjectVersion {
    pub fn is_visible(&self) -> bool {
        self.version_tag.is_some() && !self.is_deleted
    }
}

/// A resumable multipart upload job (§3 "Upload Job").
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: i64,
    pub object_id: i64,
    pub job_token: String,
    pub nbytes: u64,
    pub chunksize: u64,
    pub metadata: Metadata,
    pub acl: Acl,
}

impl UploadJob {
    /// `nchunks = nbytes / chunksize`, `remainder = nbytes % chunksize`
    /// (§4.5).
    pub fn nchunks(&self) -> u64 {
        self.nbytes / self.chunksize
    }

    pub fn remainder(&self) -> u64 {
        self.nbytes % self.chunksize
    }
}

/// A per-backend chunk tracking row (§3 "Chunk Record"), present only
/// when the storage backend declares `tracks_chunks = true`.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub upload_id: i64,
    pub position: u64,
    pub aux: String,
}

/// Validate and normalize a metadata map against the closed key set
/// (§4.3 "Metadata codecs"); unknown keys are rejected by the caller
/// before this is constructed.
pub fn is_recognized_metadata_key(key: &str) -> bool {
    METADATA_KEYS.contains(&key)
}
