//! In-process fake [`MetadataDirectory`] (ambient test tooling).
//!
//! Mirrors [`super::sqlite::SqliteDirectory`]'s invariants — the
//! re-resolve-under-transaction pattern, the two-phase version
//! visibility flip, write-once metadata — over plain in-memory maps
//! guarded by a single `Mutex`, so handler- and lifecycle-level tests
//! don't need a real SQLite connection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use crate::acl::{self, Requirement};
use crate::auth::CredentialRecord;
use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::model::{Access, Acl, ChunkRecord, Metadata, Name, ObjectVersion, RoleSet, Subtype, UploadJob};

use super::{DeleteCleanup, MetadataDirectory, ResourceRef, VersionDeleteCleanup};

#[derive(Clone)]
struct NameRec {
    id: i64,
    parent_id: Option<i64>,
    path: String,
    subtype: Subtype,
    is_deleted: bool,
    acl: Acl,
    metadata: Metadata,
}

#[derive(Clone)]
struct VersionRec {
    id: i64,
    object_id: i64,
    version_tag: Option<String>,
    nbytes: u64,
    metadata: Metadata,
    is_deleted: bool,
    acl: Acl,
}

#[derive(Clone)]
struct UploadRec {
    id: i64,
    object_id: i64,
    job_token: String,
    nbytes: u64,
    chunksize: u64,
    metadata: Metadata,
    acl: Acl,
}

#[derive(Default)]
struct State {
    names: HashMap<i64, NameRec>,
    next_name_id: i64,
    versions: HashMap<i64, VersionRec>,
    next_version_id: i64,
    uploads: HashMap<i64, UploadRec>,
    next_upload_id: i64,
    chunks: HashMap<(i64, u64), String>,
    credentials: HashMap<String, CredentialRecord>,
}

pub struct MemoryDirectory {
    state: Mutex<State>,
}

impl MemoryDirectory {
    /// Seed the permanent root namespace and grant `owner` on it to each
    /// of `root_roles`, mirroring [`super::sqlite::SqliteDirectory::new`]'s
    /// bootstrap -- without it `create_name` can never succeed for a
    /// top-level resource (root has no ancestors to roll an
    /// `ancestor_owner`/`ancestor_create` grant down from).
    pub fn new(root_roles: &[&str]) -> Self {
        let mut state = State {
            next_name_id: 2,
            next_version_id: 1,
            next_upload_id: 1,
            ..Default::default()
        };
        let mut acl = Acl::new();
        if !root_roles.is_empty() {
            let owners: RoleSet = root_roles.iter().map(|r| r.to_string()).collect();
            acl.insert(Access::Owner, owners);
        }
        state.names.insert(
            1,
            NameRec {
                id: 1,
                parent_id: None,
                path: "/".to_string(),
                subtype: Subtype::Namespace,
                is_deleted: false,
                acl,
                metadata: Metadata::new(),
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, ErrorKind> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    let mut segments = Vec::new();
    for seg in trimmed.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(ErrorKind::BadRequest(format!("illegal path segment in '{path}'")));
        }
        segments.push(seg);
    }
    Ok(segments)
}

fn parent_path(path: &str) -> Result<String, ErrorKind> {
    let segments = split_path(path)?;
    if segments.is_empty() {
        return Err(ErrorKind::BadRequest("root has no parent".into()));
    }
    if segments.len() == 1 {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", segments[..segments.len() - 1].join("/")))
    }
}

impl State {
    fn find_by_path(&self, path: &str) -> Option<&NameRec> {
        self.names.values().find(|n| n.path == path && !n.is_deleted)
    }

    fn find_tombstoned_by_path(&self, path: &str) -> bool {
        self.names.values().any(|n| n.path == path && n.is_deleted)
    }

    fn ancestor_acls(&self, mut parent_id: Option<i64>) -> Vec<Acl> {
        let mut chain = Vec::new();
        while let Some(id) = parent_id {
            match self.names.get(&id) {
                Some(rec) => {
                    chain.push(rec.acl.clone());
                    parent_id = rec.parent_id;
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    fn ancestor_ids(&self, mut parent_id: Option<i64>) -> Vec<i64> {
        let mut chain = Vec::new();
        while let Some(id) = parent_id {
            chain.push(id);
            parent_id = self.names.get(&id).and_then(|r| r.parent_id);
        }
        chain.reverse();
        chain
    }

    fn to_model_name(&self, rec: &NameRec) -> Name {
        Name {
            id: rec.id,
            parent_id: rec.parent_id,
            ancestors: self.ancestor_ids(rec.parent_id),
            path: rec.path.clone(),
            subtype: rec.subtype,
            is_deleted: rec.is_deleted,
            acl: rec.acl.clone(),
            metadata: rec.metadata.clone(),
        }
    }

    fn resolve_object(&self, object_path: &str) -> Result<NameRec, ErrorKind> {
        let row = self
            .find_by_path(object_path)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(format!("'{object_path}' does not exist")))?;
        if row.subtype != Subtype::Object {
            return Err(ErrorKind::Conflict(format!("'{object_path}' is not an object")));
        }
        Ok(row)
    }

    fn create_name_rec(
        &mut self,
        path: &str,
        subtype: Subtype,
        make_parents: bool,
        ctx: &ClientContext,
    ) -> Result<NameRec, ErrorKind> {
        if path == "/" {
            return Err(ErrorKind::Conflict("the root namespace always exists".into()));
        }
        split_path(path)?;

        if self.find_by_path(path).is_some() {
            return Err(ErrorKind::Conflict(format!("'{path}' already exists")));
        }
        if self.find_tombstoned_by_path(path) {
            return Err(ErrorKind::Conflict(format!("'{path}' is not available (soft-deleted)")));
        }

        let parent_path_str = parent_path(path)?;
        let parent = match self.find_by_path(&parent_path_str).cloned() {
            Some(row) => row,
            None if make_parents => self.create_name_rec(&parent_path_str, Subtype::Namespace, true, ctx)?,
            None => {
                return Err(ErrorKind::NotFound(format!(
                    "parent namespace '{parent_path_str}' does not exist"
                )))
            }
        };
        if parent.subtype != Subtype::Namespace {
            return Err(ErrorKind::Conflict(format!("parent '{parent_path_str}' is not a namespace")));
        }

        let ancestors = self.ancestor_acls(Some(parent.id));
        let mut chain: Vec<&Acl> = ancestors.iter().collect();
        chain.push(&parent.acl);
        acl::enforce(
            &[
                Requirement::Direct(Access::Owner),
                Requirement::Direct(Access::Create),
                Requirement::AncestorOwner,
                Requirement::AncestorCreate,
            ],
            &parent.acl,
            &chain,
            ctx,
        )?;

        let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
        let id = self.next_name_id;
        self.next_name_id += 1;
        let rec = NameRec {
            id,
            parent_id: Some(parent.id),
            path: path.to_string(),
            subtype,
            is_deleted: false,
            acl: crate::model::owner_acl(&owner),
            metadata: Metadata::new(),
        };
        self.names.insert(id, rec.clone());
        Ok(rec)
    }
}

fn apply_field(metadata: &mut Metadata, field: &str, value: Option<&str>, write_once: bool) -> Result<(), ErrorKind> {
    if write_once {
        if let Some(existing) = metadata.get(field) {
            match value {
                Some(v) if v == existing => return Ok(()),
                _ => return Err(ErrorKind::Conflict(format!("'{field}' is write-once and already set"))),
            }
        }
    }
    match value {
        Some(v) => {
            metadata.insert(field.to_string(), v.to_string());
        }
        None => {
            metadata.remove(field);
        }
    }
    Ok(())
}

macro_rules! boxfut {
    ($body:expr) => {
        Box::pin(async move { $body })
    };
}

impl MetadataDirectory for MemoryDirectory {
    fn resolve<'a>(&'a self, path: &'a str) -> Pin<Box<dyn Future<Output = Result<Option<Name>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            Ok(state.find_by_path(path).map(|r| state.to_model_name(r)))
        })
    }

    fn create_name<'a>(
        &'a self,
        path: &'a str,
        subtype: Subtype,
        make_parents: bool,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Name, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let rec = state.create_name_rec(path, subtype, make_parents, ctx)?;
            Ok(state.to_model_name(&rec))
        })
    }

    fn delete_name<'a>(&'a self, path: &'a str, ctx: &'a ClientContext) -> Pin<Box<dyn Future<Output = Result<DeleteCleanup, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let root = state
                .find_by_path(path)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            if root.id == 1 {
                return Err(ErrorKind::Forbidden("the root namespace cannot be deleted".into()));
            }

            let prefix = format!("{}/", path.trim_end_matches('/'));
            let subtree: Vec<NameRec> = state
                .names
                .values()
                .filter(|n| !n.is_deleted && (n.path == path || n.path.starts_with(&prefix)))
                .cloned()
                .collect();

            for row in &subtree {
                let ancestors = state.ancestor_acls(row.parent_id);
                let chain: Vec<&Acl> = ancestors.iter().collect();
                acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &row.acl, &chain, ctx)?;
            }

            let mut cleanup = DeleteCleanup::default();
            for row in &subtree {
                state.names.get_mut(&row.id).unwrap().is_deleted = true;

                if row.subtype == Subtype::Namespace {
                    cleanup.namespaces_to_purge.push(row.path.clone());
                    continue;
                }

                let version_ids: Vec<i64> = state
                    .versions
                    .values()
                    .filter(|v| v.object_id == row.id && !v.is_deleted)
                    .map(|v| v.id)
                    .collect();
                for vid in version_ids {
                    let v = state.versions.get_mut(&vid).unwrap();
                    v.is_deleted = true;
                    if let Some(tag) = v.version_tag.clone() {
                        cleanup.versions_to_purge.push((row.path.clone(), tag));
                    }
                }

                let upload_ids: Vec<i64> = state
                    .uploads
                    .values()
                    .filter(|u| u.object_id == row.id)
                    .map(|u| u.id)
                    .collect();
                for uid in upload_ids {
                    let token = state.uploads.remove(&uid).unwrap().job_token;
                    state.chunks.retain(|(u, _), _| *u != uid);
                    cleanup.uploads_to_cancel.push((row.path.clone(), token));
                }
            }

            Ok(cleanup)
        })
    }

    fn enumerate_children<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Name>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let parent = state
                .find_by_path(path)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;

            let ancestors = state.ancestor_acls(parent.parent_id);
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&parent.acl);
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Read),
                    Requirement::AncestorOwner,
                    Requirement::AncestorRead,
                ],
                &parent.acl,
                &chain,
                ctx,
            )?;

            let prefix = format!("{}/", path.trim_end_matches('/'));
            let result: Vec<Name> = state
                .names
                .values()
                .filter(|n| {
                    !n.is_deleted
                        && if recursive {
                            n.path.starts_with(&prefix)
                        } else {
                            n.parent_id == Some(parent.id)
                        }
                })
                .map(|n| state.to_model_name(n))
                .collect();
            Ok(result)
        })
    }

    fn enumerate_uploads<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UploadJob>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let parent = state
                .find_by_path(path)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;

            let ancestors = state.ancestor_acls(parent.parent_id);
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&parent.acl);
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &parent.acl, &chain, ctx)?;

            let prefix = format!("{}/", path.trim_end_matches('/'));
            let object_ids: Vec<i64> = if recursive {
                state
                    .names
                    .values()
                    .filter(|n| !n.is_deleted && n.subtype == Subtype::Object && (n.path == path || n.path.starts_with(&prefix)))
                    .map(|n| n.id)
                    .collect()
            } else {
                vec![parent.id]
            };

            Ok(state
                .uploads
                .values()
                .filter(|u| object_ids.contains(&u.object_id))
                .map(|u| UploadJob {
                    id: u.id,
                    object_id: u.object_id,
                    job_token: u.job_token.clone(),
                    nbytes: u.nbytes,
                    chunksize: u.chunksize,
                    metadata: u.metadata.clone(),
                    acl: u.acl.clone(),
                })
                .collect())
        })
    }

    fn enumerate_versions<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Read),
                    Requirement::AncestorOwner,
                    Requirement::AncestorRead,
                ],
                &object.acl,
                &chain,
                ctx,
            )?;

            let mut versions: Vec<VersionRec> = state
                .versions
                .values()
                .filter(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.is_some())
                .cloned()
                .collect();
            versions.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(versions.into_iter().map(to_model_version).collect())
        })
    }

    fn current_version<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Read),
                    Requirement::AncestorOwner,
                    Requirement::AncestorRead,
                ],
                &object.acl,
                &chain,
                ctx,
            )?;

            let current = state
                .versions
                .values()
                .filter(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.is_some())
                .max_by_key(|v| v.id)
                .cloned();
            Ok(current.map(to_model_version))
        })
    }

    fn get_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Read),
                    Requirement::AncestorOwner,
                    Requirement::AncestorRead,
                ],
                &object.acl,
                &chain,
                ctx,
            )?;

            Ok(state
                .versions
                .values()
                .find(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.as_deref() == Some(version_tag))
                .cloned()
                .map(to_model_version))
        })
    }

    fn create_version<'a>(
        &'a self,
        object_path: &'a str,
        nbytes: u64,
        metadata: Metadata,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<i64, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Update),
                    Requirement::AncestorOwner,
                    Requirement::AncestorUpdate,
                ],
                &object.acl,
                &chain,
                ctx,
            )?;

            let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
            let id = state.next_version_id;
            state.next_version_id += 1;
            state.versions.insert(
                id,
                VersionRec {
                    id,
                    object_id: object.id,
                    version_tag: None,
                    nbytes,
                    metadata,
                    is_deleted: true,
                    acl: crate::model::owner_acl(&owner),
                },
            );
            Ok(id)
        })
    }

    fn complete_version<'a>(&'a self, serial_id: i64, tag: &'a str) -> Pin<Box<dyn Future<Output = Result<ObjectVersion, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let rec = state
                .versions
                .get_mut(&serial_id)
                .ok_or_else(|| ErrorKind::NotFound("version not found".into()))?;
            rec.version_tag = Some(tag.to_string());
            rec.is_deleted = false;
            Ok(to_model_version(rec.clone()))
        })
    }

    fn delete_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: Option<&'a str>,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<VersionDeleteCleanup, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let object_ancestors = state.ancestor_acls(object.parent_id);

            let targets: Vec<VersionRec> = match version_tag {
                Some(tag) => {
                    let v = state
                        .versions
                        .values()
                        .find(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.as_deref() == Some(tag))
                        .cloned()
                        .ok_or_else(|| ErrorKind::NotFound(format!("version '{tag}' not found")))?;
                    vec![v]
                }
                None => state
                    .versions
                    .values()
                    .filter(|v| v.object_id == object.id && !v.is_deleted)
                    .cloned()
                    .collect(),
            };

            let mut cleanup = VersionDeleteCleanup::default();
            for v in targets {
                let mut chain: Vec<&Acl> = object_ancestors.iter().collect();
                chain.push(&object.acl);
                acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &v.acl, &chain, ctx)?;
                state.versions.get_mut(&v.id).unwrap().is_deleted = true;
                if let Some(tag) = v.version_tag {
                    cleanup.versions_to_purge.push((object_path.to_string(), tag));
                }
            }
            Ok(cleanup)
        })
    }

    fn update_metadata_field<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        field: &'a str,
        value: Option<&'a str>,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            if !crate::model::is_recognized_metadata_key(field) {
                return Err(ErrorKind::BadRequest(format!("unrecognized metadata field '{field}'")));
            }
            let write_once = field == "content-md5" || field == "content-sha256";
            let mut state = self.state.lock().unwrap();

            match resource {
                ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
                    let row = state
                        .find_by_path(path)
                        .cloned()
                        .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
                    let ancestors = state.ancestor_acls(row.parent_id);
                    let chain: Vec<&Acl> = ancestors.iter().collect();
                    acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &row.acl, &chain, ctx)?;
                    let rec = state.names.get_mut(&row.id).unwrap();
                    apply_field(&mut rec.metadata, field, value, write_once)?;
                }
                ResourceRef::Version(object_path, tag) => {
                    let object = state.resolve_object(object_path)?;
                    let v = state
                        .versions
                        .values()
                        .find(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.as_deref() == Some(tag))
                        .cloned()
                        .ok_or_else(|| ErrorKind::NotFound(format!("version '{tag}' not found")))?;
                    let ancestors = state.ancestor_acls(object.parent_id);
                    let mut chain: Vec<&Acl> = ancestors.iter().collect();
                    chain.push(&object.acl);
                    acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &v.acl, &chain, ctx)?;
                    let rec = state.versions.get_mut(&v.id).unwrap();
                    apply_field(&mut rec.metadata, field, value, write_once)?;
                }
                ResourceRef::Upload(object_path, job_token) => {
                    let object = state.resolve_object(object_path)?;
                    let u = state
                        .uploads
                        .values()
                        .find(|u| u.object_id == object.id && u.job_token == job_token)
                        .cloned()
                        .ok_or_else(|| ErrorKind::NotFound(format!("upload '{job_token}' not found")))?;
                    acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
                    let rec = state.uploads.get_mut(&u.id).unwrap();
                    apply_field(&mut rec.metadata, field, value, write_once)?;
                }
            }
            Ok(())
        })
    }

    fn create_upload<'a>(
        &'a self,
        object_path: &'a str,
        job_token: String,
        chunksize: u64,
        nbytes: u64,
        metadata: Metadata,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<UploadJob, ErrorKind>> + Send + 'a>> {
        boxfut!({
            if chunksize == 0 {
                return Err(ErrorKind::BadRequest("chunk size must be > 0".into()));
            }
            let mut state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[
                    Requirement::Direct(Access::Owner),
                    Requirement::Direct(Access::Update),
                    Requirement::AncestorOwner,
                    Requirement::AncestorUpdate,
                ],
                &object.acl,
                &chain,
                ctx,
            )?;

            let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
            let acl = crate::model::owner_acl(&owner);
            let id = state.next_upload_id;
            state.next_upload_id += 1;
            let rec = UploadRec {
                id,
                object_id: object.id,
                job_token: job_token.clone(),
                nbytes,
                chunksize,
                metadata: metadata.clone(),
                acl: acl.clone(),
            };
            state.uploads.insert(id, rec);
            Ok(UploadJob {
                id,
                object_id: object.id,
                job_token,
                nbytes,
                chunksize,
                metadata,
                acl,
            })
        })
    }

    fn get_upload<'a>(
        &'a self,
        object_path: &'a str,
        job_token: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<UploadJob, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let object = state.resolve_object(object_path)?;
            let u = state
                .uploads
                .values()
                .find(|u| u.object_id == object.id && u.job_token == job_token)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("upload '{job_token}' not found")))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
            Ok(UploadJob {
                id: u.id,
                object_id: u.object_id,
                job_token: u.job_token,
                nbytes: u.nbytes,
                chunksize: u.chunksize,
                metadata: u.metadata,
                acl: u.acl,
            })
        })
    }

    fn put_chunk_record<'a>(&'a self, upload_id: i64, position: u64, aux: String) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            state.chunks.insert((upload_id, position), aux);
            Ok(())
        })
    }

    fn get_chunk_records<'a>(&'a self, upload_id: i64) -> Pin<Box<dyn Future<Output = Result<Vec<ChunkRecord>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            let mut records: Vec<ChunkRecord> = state
                .chunks
                .iter()
                .filter(|((u, _), _)| *u == upload_id)
                .map(|((u, p), aux)| ChunkRecord {
                    upload_id: *u,
                    position: *p,
                    aux: aux.clone(),
                })
                .collect();
            records.sort_by_key(|c| c.position);
            Ok(records)
        })
    }

    fn finalize_upload<'a>(
        &'a self,
        upload_id: i64,
        tag: String,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectVersion, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let upload = state
                .uploads
                .get(&upload_id)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound("upload not found".into()))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &upload.acl, &[], ctx)?;

            let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
            let version_id = state.next_version_id;
            state.next_version_id += 1;
            let rec = VersionRec {
                id: version_id,
                object_id: upload.object_id,
                version_tag: Some(tag),
                nbytes: upload.nbytes,
                metadata: upload.metadata,
                is_deleted: false,
                acl: crate::model::owner_acl(&owner),
            };
            state.versions.insert(version_id, rec.clone());
            state.uploads.remove(&upload_id);
            state.chunks.retain(|(u, _), _| *u != upload_id);
            Ok(to_model_version(rec))
        })
    }

    fn cancel_upload<'a>(&'a self, upload_id: i64, ctx: &'a ClientContext) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            let upload = state
                .uploads
                .get(&upload_id)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound("upload not found".into()))?;
            let object = state
                .names
                .get(&upload.object_id)
                .cloned()
                .ok_or_else(|| ErrorKind::Internal(anyhow::anyhow!("dangling upload object_id")))?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &upload.acl, &chain, ctx)?;

            state.uploads.remove(&upload_id);
            state.chunks.retain(|(u, _), _| *u != upload_id);
            Ok(())
        })
    }

    fn get_acl<'a>(&'a self, resource: ResourceRef<'a>, ctx: &'a ClientContext) -> Pin<Box<dyn Future<Output = Result<Acl, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            with_resource_acl(&state, resource, ctx, |acl, _| Ok(acl.clone()))
        })
    }

    fn set_acl_role<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        role: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            mutate_resource_acl(&mut state, resource, ctx, |acl| {
                acl::set_role(acl, access, role);
                Ok(())
            })
        })
    }

    fn drop_acl_role<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        role: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            mutate_resource_acl(&mut state, resource, ctx, |acl| acl::drop_role(acl, access, role))
        })
    }

    fn set_acl<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        access: Access,
        roles: RoleSet,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            mutate_resource_acl(&mut state, resource, ctx, |acl| {
                acl::set(acl, access, roles.clone());
                Ok(())
            })
        })
    }

    fn get_credential<'a>(&'a self, client_id: &'a str) -> Pin<Box<dyn Future<Output = Result<Option<CredentialRecord>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let state = self.state.lock().unwrap();
            Ok(state.credentials.get(client_id).cloned())
        })
    }

    fn put_credential<'a>(&'a self, record: CredentialRecord) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut state = self.state.lock().unwrap();
            state.credentials.insert(record.client_id.clone(), record);
            Ok(())
        })
    }
}

fn to_model_version(rec: VersionRec) -> ObjectVersion {
    ObjectVersion {
        id: rec.id,
        object_id: rec.object_id,
        version_tag: rec.version_tag,
        nbytes: rec.nbytes,
        metadata: rec.metadata,
        is_deleted: rec.is_deleted,
        acl: rec.acl,
    }
}

fn with_resource_acl<F, T>(state: &State, resource: ResourceRef<'_>, ctx: &ClientContext, f: F) -> Result<T, ErrorKind>
where
    F: FnOnce(&Acl, &[&Acl]) -> Result<T, ErrorKind>,
{
    match resource {
        ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
            let row = state
                .find_by_path(path)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            let ancestors = state.ancestor_acls(row.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &row.acl, &chain, ctx)?;
            f(&row.acl, &chain)
        }
        ResourceRef::Version(object_path, tag) => {
            let object = state.resolve_object(object_path)?;
            let v = state
                .versions
                .values()
                .find(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.as_deref() == Some(tag))
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("version '{tag}' not found")))?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&object.acl);
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &v.acl, &chain, ctx)?;
            f(&v.acl, &chain)
        }
        ResourceRef::Upload(object_path, job_token) => {
            let object = state.resolve_object(object_path)?;
            let u = state
                .uploads
                .values()
                .find(|u| u.object_id == object.id && u.job_token == job_token)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("upload '{job_token}' not found")))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
            f(&u.acl, &[])
        }
    }
}

fn mutate_resource_acl<F>(state: &mut State, resource: ResourceRef<'_>, ctx: &ClientContext, f: F) -> Result<(), ErrorKind>
where
    F: FnOnce(&mut Acl) -> Result<(), ErrorKind>,
{
    match resource {
        ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
            let row = state
                .find_by_path(path)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            let ancestors = state.ancestor_acls(row.parent_id);
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &row.acl, &chain, ctx)?;
            let rec = state.names.get_mut(&row.id).unwrap();
            f(&mut rec.acl)
        }
        ResourceRef::Version(object_path, tag) => {
            let object = state.resolve_object(object_path)?;
            let v = state
                .versions
                .values()
                .find(|v| v.object_id == object.id && !v.is_deleted && v.version_tag.as_deref() == Some(tag))
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("version '{tag}' not found")))?;
            let ancestors = state.ancestor_acls(object.parent_id);
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&object.acl);
            acl::enforce(&[Requirement::Direct(Access::Owner), Requirement::AncestorOwner], &v.acl, &chain, ctx)?;
            let rec = state.versions.get_mut(&v.id).unwrap();
            f(&mut rec.acl)
        }
        ResourceRef::Upload(object_path, job_token) => {
            let object = state.resolve_object(object_path)?;
            let u = state
                .uploads
                .values()
                .find(|u| u.object_id == object.id && u.job_token == job_token)
                .cloned()
                .ok_or_else(|| ErrorKind::NotFound(format!("upload '{job_token}' not found")))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
            let rec = state.uploads.get_mut(&u.id).unwrap();
            f(&mut rec.acl)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_ctx() -> ClientContext {
        ClientContext::authenticated("alice")
    }

    #[tokio::test]
    async fn create_and_resolve_namespace() {
        let dir = MemoryDirectory::new(&["*"]);
        let name = dir.create_name("/a", Subtype::Namespace, false, &owner_ctx()).await.unwrap();
        assert_eq!(name.path, "/a");
        assert!(dir.resolve("/a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_with_make_parents_creates_ancestors() {
        let dir = MemoryDirectory::new(&["*"]);
        dir.create_name("/a/b", Subtype::Namespace, true, &owner_ctx()).await.unwrap();
        assert!(dir.resolve("/a").await.unwrap().is_some());
        assert!(dir.resolve("/a/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn version_is_invisible_until_completed() {
        let dir = MemoryDirectory::new(&["*"]);
        let ctx = owner_ctx();
        dir.create_name("/a", Subtype::Namespace, false, &ctx).await.unwrap();
        dir.create_name("/a/obj", Subtype::Object, false, &ctx).await.unwrap();
        let serial = dir.create_version("/a/obj", 5, Metadata::new(), &ctx).await.unwrap();
        assert!(dir.current_version("/a/obj", &ctx).await.unwrap().is_none());
        dir.complete_version(serial, "TAG1").await.unwrap();
        let current = dir.current_version("/a/obj", &ctx).await.unwrap().unwrap();
        assert_eq!(current.version_tag.as_deref(), Some("TAG1"));
    }

    #[tokio::test]
    async fn root_cannot_be_deleted() {
        let dir = MemoryDirectory::new(&["*"]);
        let err = dir.delete_name("/", &owner_ctx()).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Forbidden(_)));
    }

    #[tokio::test]
    async fn delete_namespace_tombstones_descendants() {
        let dir = MemoryDirectory::new(&["*"]);
        let ctx = owner_ctx();
        dir.create_name("/a", Subtype::Namespace, false, &ctx).await.unwrap();
        dir.create_name("/a/obj", Subtype::Object, false, &ctx).await.unwrap();
        dir.delete_name("/a", &ctx).await.unwrap();
        assert!(dir.resolve("/a").await.unwrap().is_none());
        assert!(dir.resolve("/a/obj").await.unwrap().is_none());
    }
}
