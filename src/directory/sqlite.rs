//! SQLite-backed metadata directory (C3).
//!
//! Uses `rusqlite` with the `bundled` feature, guarded by a single
//! `Mutex<Connection>` (one DB connection per pool slot; here a single
//! connection protected by a lock, mirroring the source project's
//! pattern). Every public operation opens an immediate transaction,
//! re-resolves the resources it touches by id, checks ACLs against the
//! freshly-loaded rows, mutates, and commits — the "re-resolve under
//! transaction" pattern (§9).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::acl::{self, Requirement};
use crate::auth::CredentialRecord;
use crate::context::ClientContext;
use crate::errors::ErrorKind;
use crate::model::{
    Access, Acl, ChunkRecord, Metadata, Name, ObjectVersion, RoleSet, Subtype, UploadJob,
};

use super::{DeleteCleanup, MetadataDirectory, ResourceRef, VersionDeleteCleanup};

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    /// Open (or create) the database at `path`, initialize the schema,
    /// and grant `owner` on the root namespace to each of `root_roles`
    /// (the original's `deploy_db(root_roles)` bootstrap, re-applied
    /// idempotently on every startup -- see [`DirectoryConfig::root_roles`]
    /// (`crate::config::DirectoryConfig`)). Passing `":memory:"` is
    /// useful for tests.
    pub fn new(path: &str, root_roles: &[&str]) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db(root_roles)?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create tables/indexes if missing, seed the permanent root
    /// namespace, and grant `owner` on it to `root_roles`. Idempotent:
    /// safe to call on every startup (crash-only design, §9) -- roles
    /// already granted are left alone, new ones are added, and none are
    /// ever revoked here.
    fn init_db(&self, root_roles: &[&str]) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS name (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id   INTEGER,
                path        TEXT NOT NULL,
                subtype     INTEGER NOT NULL CHECK (subtype IN (0, 1)),
                is_deleted  INTEGER NOT NULL DEFAULT 0,
                acl         TEXT NOT NULL DEFAULT '{}',
                metadata    TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_name_path_live
                ON name(path) WHERE is_deleted = 0;

            CREATE TABLE IF NOT EXISTS version (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id    INTEGER NOT NULL,
                version_tag  TEXT,
                nbytes       INTEGER NOT NULL,
                metadata     TEXT NOT NULL DEFAULT '{}',
                is_deleted   INTEGER NOT NULL DEFAULT 0,
                acl          TEXT NOT NULL DEFAULT '{}',
                created_at   TEXT NOT NULL,
                CHECK (version_tag IS NOT NULL OR is_deleted = 1)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_version_tag
                ON version(object_id, version_tag) WHERE version_tag IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_version_object
                ON version(object_id);

            CREATE TABLE IF NOT EXISTS upload (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id   INTEGER NOT NULL,
                job_token   TEXT NOT NULL,
                nbytes      INTEGER NOT NULL,
                chunksize   INTEGER NOT NULL CHECK (chunksize > 0),
                metadata    TEXT NOT NULL DEFAULT '{}',
                acl         TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_upload_object ON upload(object_id);

            CREATE TABLE IF NOT EXISTS chunk (
                upload_id INTEGER NOT NULL,
                position  INTEGER NOT NULL,
                aux       TEXT NOT NULL,
                PRIMARY KEY (upload_id, position)
            );

            CREATE TABLE IF NOT EXISTS credential (
                client_id     TEXT PRIMARY KEY,
                secret_key    TEXT NOT NULL,
                display_name  TEXT NOT NULL DEFAULT '',
                active        INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL
            );
            ",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        // Seed the permanent root namespace (id=1). Never deletable.
        let root_exists: bool = conn
            .query_row("SELECT 1 FROM name WHERE id = 1", [], |_| Ok(()))
            .optional()?
            .is_some();
        if !root_exists {
            conn.execute(
                "INSERT INTO name (id, parent_id, path, subtype, is_deleted, acl, metadata, created_at)
                 VALUES (1, NULL, '/', 0, 0, '{}', '{}', ?1)",
                params![now()],
            )?;
        }

        if !root_roles.is_empty() {
            let current_acl: String = conn.query_row("SELECT acl FROM name WHERE id = 1", [], |r| r.get(0))?;
            let mut acl = acl_from_json(&current_acl);
            let owners = acl.entry(Access::Owner).or_default();
            let mut changed = false;
            for role in root_roles {
                changed |= owners.insert(role.to_string());
            }
            if changed {
                conn.execute("UPDATE name SET acl = ?1 WHERE id = 1", params![acl_to_json(&acl)])?;
            }
        }

        Ok(())
    }

    pub fn seed_credential(&self, client_id: &str, secret_key: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO credential (client_id, secret_key, display_name, active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![client_id, secret_key, client_id, now()],
        )?;
        Ok(())
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn acl_to_json(acl: &Acl) -> String {
    let map: BTreeMap<String, Vec<String>> = acl
        .iter()
        .map(|(access, roles)| {
            let mut roles: Vec<String> = roles.iter().cloned().collect();
            roles.sort();
            (access.as_str().to_string(), roles)
        })
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

fn acl_from_json(s: &str) -> Acl {
    let map: BTreeMap<String, Vec<String>> = serde_json::from_str(s).unwrap_or_default();
    map.into_iter()
        .filter_map(|(k, v)| Access::parse(&k).map(|a| (a, v.into_iter().collect::<RoleSet>())))
        .collect()
}

fn metadata_to_json(m: &Metadata) -> String {
    serde_json::to_string(m).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(s: &str) -> Metadata {
    serde_json::from_str(s).unwrap_or_default()
}

fn subtype_to_int(s: Subtype) -> i64 {
    match s {
        Subtype::Namespace => 0,
        Subtype::Object => 1,
    }
}

fn subtype_from_int(i: i64) -> Subtype {
    if i == 1 {
        Subtype::Object
    } else {
        Subtype::Namespace
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
            return Err(ErrorKind::BadRequest(format!(
                "illegal path segment in '{path}'"
            )));
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

/// A raw `name` row, loaded without yet resolving its ancestor chain.
struct NameRow {
    id: i64,
    parent_id: Option<i64>,
    path: String,
    subtype: Subtype,
    is_deleted: bool,
    acl: Acl,
    metadata: Metadata,
}

fn row_to_name_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NameRow> {
    Ok(NameRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        path: row.get(2)?,
        subtype: subtype_from_int(row.get(3)?),
        is_deleted: row.get::<_, i64>(4)? != 0,
        acl: acl_from_json(&row.get::<_, String>(5)?),
        metadata: metadata_from_json(&row.get::<_, String>(6)?),
    })
}

const NAME_COLUMNS: &str = "id, parent_id, path, subtype, is_deleted, acl, metadata";

fn find_name_row_by_path(tx: &Transaction<'_>, path: &str) -> rusqlite::Result<Option<NameRow>> {
    tx.query_row(
        &format!("SELECT {NAME_COLUMNS} FROM name WHERE path = ?1 AND is_deleted = 0"),
        params![path],
        row_to_name_row,
    )
    .optional()
}

fn find_name_row_by_id(tx: &Transaction<'_>, id: i64) -> rusqlite::Result<Option<NameRow>> {
    tx.query_row(
        &format!("SELECT {NAME_COLUMNS} FROM name WHERE id = ?1"),
        params![id],
        row_to_name_row,
    )
    .optional()
}

/// Ancestor ACLs from root down to (but excluding) the resource itself,
/// used for the `ancestor_*` rollups in §4.2.
fn ancestor_acls(tx: &Transaction<'_>, mut parent_id: Option<i64>) -> rusqlite::Result<Vec<Acl>> {
    let mut chain = Vec::new();
    while let Some(id) = parent_id {
        let row = find_name_row_by_id(tx, id)?;
        match row {
            Some(r) => {
                chain.push(r.acl);
                parent_id = r.parent_id;
            }
            None => break,
        }
    }
    chain.reverse();
    Ok(chain)
}

fn ancestor_ids(tx: &Transaction<'_>, mut parent_id: Option<i64>) -> rusqlite::Result<Vec<i64>> {
    let mut chain = Vec::new();
    while let Some(id) = parent_id {
        chain.push(id);
        let row = find_name_row_by_id(tx, id)?;
        parent_id = row.and_then(|r| r.parent_id);
    }
    chain.reverse();
    Ok(chain)
}

fn to_model_name(tx: &Transaction<'_>, row: NameRow) -> rusqlite::Result<Name> {
    let ancestors = ancestor_ids(tx, row.parent_id)?;
    Ok(Name {
        id: row.id,
        parent_id: row.parent_id,
        ancestors,
        path: row.path,
        subtype: row.subtype,
        is_deleted: row.is_deleted,
        acl: row.acl,
        metadata: row.metadata,
    })
}

fn require_namespace_parent(tx: &Transaction<'_>, path: &str) -> Result<NameRow, ErrorKind> {
    let parent = parent_path(path)?;
    let parent_row = find_name_row_by_path(tx, &parent)
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| ErrorKind::NotFound(format!("parent namespace '{parent}' does not exist")))?;
    if parent_row.subtype != Subtype::Namespace {
        return Err(ErrorKind::Conflict(format!(
            "parent '{parent}' is not a namespace"
        )));
    }
    Ok(parent_row)
}

/// Create `path` as `subtype`, recursively creating missing ancestor
/// namespaces first when `make_parents` is set (§4.1 "create").
fn create_name_tx(
    tx: &Transaction<'_>,
    path: &str,
    subtype: Subtype,
    make_parents: bool,
    ctx: &ClientContext,
) -> Result<NameRow, ErrorKind> {
    if path == "/" {
        return Err(ErrorKind::Conflict("the root namespace always exists".into()));
    }
    split_path(path)?;

    if let Some(existing) = find_name_row_by_path(tx, path).map_err(anyhow::Error::from)? {
        let _ = existing;
        return Err(ErrorKind::Conflict(format!("'{path}' already exists")));
    }
    // A soft-deleted row at this exact path also blocks creation.
    let tombstoned: bool = tx
        .query_row(
            "SELECT 1 FROM name WHERE path = ?1 AND is_deleted = 1",
            params![path],
            |_| Ok(()),
        )
        .optional()
        .map_err(anyhow::Error::from)?
        .is_some();
    if tombstoned {
        return Err(ErrorKind::Conflict(format!(
            "'{path}' is not available (soft-deleted)"
        )));
    }

    let parent = parent_path(path)?;
    let parent_row = match find_name_row_by_path(tx, &parent).map_err(anyhow::Error::from)? {
        Some(row) => row,
        None if make_parents => create_name_tx(tx, &parent, Subtype::Namespace, true, ctx)?,
        None => {
            return Err(ErrorKind::NotFound(format!(
                "parent namespace '{parent}' does not exist"
            )))
        }
    };
    if parent_row.subtype != Subtype::Namespace {
        return Err(ErrorKind::Conflict(format!(
            "parent '{parent}' is not a namespace"
        )));
    }

    let ancestors = ancestor_acls(tx, Some(parent_row.id)).map_err(anyhow::Error::from)?;
    let mut chain: Vec<&Acl> = ancestors.iter().collect();
    chain.push(&parent_row.acl);
    acl::enforce(
        &[
            Requirement::Direct(Access::Owner),
            Requirement::Direct(Access::Create),
            Requirement::AncestorOwner,
            Requirement::AncestorCreate,
        ],
        &parent_row.acl,
        &chain,
        ctx,
    )?;

    let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
    let acl = crate::model::owner_acl(&owner);
    tx.execute(
        "INSERT INTO name (parent_id, path, subtype, is_deleted, acl, metadata, created_at)
         VALUES (?1, ?2, ?3, 0, ?4, '{}', ?5)",
        params![
            parent_row.id,
            path,
            subtype_to_int(subtype),
            acl_to_json(&acl),
            now()
        ],
    )
    .map_err(anyhow::Error::from)?;
    let id = tx.last_insert_rowid();

    Ok(NameRow {
        id,
        parent_id: Some(parent_row.id),
        path: path.to_string(),
        subtype,
        is_deleted: false,
        acl,
        metadata: Metadata::new(),
    })
}

fn resolve_object(tx: &Transaction<'_>, object_path: &str) -> Result<NameRow, ErrorKind> {
    let row = find_name_row_by_path(tx, object_path)
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| ErrorKind::NotFound(format!("'{object_path}' does not exist")))?;
    if row.subtype != Subtype::Object {
        return Err(ErrorKind::Conflict(format!("'{object_path}' is not an object")));
    }
    Ok(row)
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectVersion> {
    Ok(ObjectVersion {
        id: row.get(0)?,
        object_id: row.get(1)?,
        version_tag: row.get(2)?,
        nbytes: row.get::<_, i64>(3)? as u64,
        metadata: metadata_from_json(&row.get::<_, String>(4)?),
        is_deleted: row.get::<_, i64>(5)? != 0,
        acl: acl_from_json(&row.get::<_, String>(6)?),
    })
}

const VERSION_COLUMNS: &str = "id, object_id, version_tag, nbytes, metadata, is_deleted, acl";

fn row_to_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadJob> {
    Ok(UploadJob {
        id: row.get(0)?,
        object_id: row.get(1)?,
        job_token: row.get(2)?,
        nbytes: row.get::<_, i64>(3)? as u64,
        chunksize: row.get::<_, i64>(4)? as u64,
        metadata: metadata_from_json(&row.get::<_, String>(5)?),
        acl: acl_from_json(&row.get::<_, String>(6)?),
    })
}

const UPLOAD_COLUMNS: &str = "id, object_id, job_token, nbytes, chunksize, metadata, acl";

macro_rules! boxfut {
    ($body:expr) => {
        Box::pin(async move { $body })
    };
}

impl MetadataDirectory for SqliteDirectory {
    fn resolve<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Name>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let row = find_name_row_by_path(&tx, path).map_err(anyhow::Error::from)?;
            match row {
                Some(r) => Ok(Some(to_model_name(&tx, r).map_err(anyhow::Error::from)?)),
                None => Ok(None),
            }
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let row = create_name_tx(&tx, path, subtype, make_parents, ctx)?;
            let name = to_model_name(&tx, row).map_err(anyhow::Error::from)?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(name)
        })
    }

    fn delete_name<'a>(
        &'a self,
        path: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<DeleteCleanup, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;

            let root = find_name_row_by_path(&tx, path)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            if root.id == 1 {
                return Err(ErrorKind::Forbidden("the root namespace cannot be deleted".into()));
            }

            // Collect the subtree: root plus every descendant by path prefix.
            let like_pattern = format!("{}/%", path.trim_end_matches('/'));
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {NAME_COLUMNS} FROM name WHERE is_deleted = 0 AND (path = ?1 OR path LIKE ?2)"
                ))
                .map_err(anyhow::Error::from)?;
            let subtree: Vec<NameRow> = stmt
                .query_map(params![path, like_pattern], row_to_name_row)
                .map_err(anyhow::Error::from)?
                .collect::<rusqlite::Result<_>>()
                .map_err(anyhow::Error::from)?;
            drop(stmt);

            let mut cleanup = DeleteCleanup::default();

            for row in &subtree {
                let ancestors = ancestor_acls(&tx, row.parent_id).map_err(anyhow::Error::from)?;
                let chain: Vec<&Acl> = ancestors.iter().collect();
                acl::enforce(
                    &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                    &row.acl,
                    &chain,
                    ctx,
                )?;
            }

            for row in &subtree {
                tx.execute("UPDATE name SET is_deleted = 1 WHERE id = ?1", params![row.id])
                    .map_err(anyhow::Error::from)?;

                if row.subtype == Subtype::Namespace {
                    cleanup.namespaces_to_purge.push(row.path.clone());
                    continue;
                }

                let mut vstmt = tx
                    .prepare(&format!(
                        "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND is_deleted = 0"
                    ))
                    .map_err(anyhow::Error::from)?;
                let versions: Vec<ObjectVersion> = vstmt
                    .query_map(params![row.id], row_to_version)
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?;
                drop(vstmt);
                for v in versions {
                    tx.execute("UPDATE version SET is_deleted = 1 WHERE id = ?1", params![v.id])
                        .map_err(anyhow::Error::from)?;
                    if let Some(tag) = v.version_tag {
                        cleanup.versions_to_purge.push((row.path.clone(), tag));
                    }
                }

                let mut ustmt = tx
                    .prepare(&format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1"))
                    .map_err(anyhow::Error::from)?;
                let uploads: Vec<UploadJob> = ustmt
                    .query_map(params![row.id], row_to_upload)
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?;
                drop(ustmt);
                for u in uploads {
                    tx.execute("DELETE FROM chunk WHERE upload_id = ?1", params![u.id])
                        .map_err(anyhow::Error::from)?;
                    tx.execute("DELETE FROM upload WHERE id = ?1", params![u.id])
                        .map_err(anyhow::Error::from)?;
                    cleanup.uploads_to_cancel.push((row.path.clone(), u.job_token));
                }
            }

            tx.commit().map_err(anyhow::Error::from)?;
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
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let parent = find_name_row_by_path(&tx, path)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;

            let ancestors = ancestor_acls(&tx, parent.parent_id).map_err(anyhow::Error::from)?;
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

            let rows: Vec<NameRow> = if recursive {
                let like_pattern = format!("{}/%", path.trim_end_matches('/'));
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {NAME_COLUMNS} FROM name WHERE is_deleted = 0 AND path LIKE ?1"
                    ))
                    .map_err(anyhow::Error::from)?;
                stmt.query_map(params![like_pattern], row_to_name_row)
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?
            } else {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {NAME_COLUMNS} FROM name WHERE is_deleted = 0 AND parent_id = ?1"
                    ))
                    .map_err(anyhow::Error::from)?;
                stmt.query_map(params![parent.id], row_to_name_row)
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?
            };

            rows.into_iter()
                .map(|r| to_model_name(&tx, r).map_err(|e| ErrorKind::Internal(e.into())))
                .collect()
        })
    }

    fn enumerate_uploads<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<UploadJob>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let parent = find_name_row_by_path(&tx, path)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;

            let ancestors = ancestor_acls(&tx, parent.parent_id).map_err(anyhow::Error::from)?;
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&parent.acl);
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &parent.acl,
                &chain,
                ctx,
            )?;

            let object_ids: Vec<i64> = if recursive {
                let like_pattern = format!("{}/%", path.trim_end_matches('/'));
                let mut stmt = tx
                    .prepare("SELECT id FROM name WHERE is_deleted = 0 AND subtype = 1 AND (path = ?1 OR path LIKE ?2)")
                    .map_err(anyhow::Error::from)?;
                stmt.query_map(params![path, like_pattern], |r| r.get(0))
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?
            } else {
                vec![parent.id]
            };

            let mut uploads = Vec::new();
            for object_id in object_ids {
                let mut stmt = tx
                    .prepare(&format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1"))
                    .map_err(anyhow::Error::from)?;
                let rows: Vec<UploadJob> = stmt
                    .query_map(params![object_id], row_to_upload)
                    .map_err(anyhow::Error::from)?
                    .collect::<rusqlite::Result<_>>()
                    .map_err(anyhow::Error::from)?;
                uploads.extend(rows);
            }
            Ok(uploads)
        })
    }

    fn enumerate_versions<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;

            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
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

            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND is_deleted = 0 AND version_tag IS NOT NULL ORDER BY id DESC"
                ))
                .map_err(anyhow::Error::from)?;
            stmt.query_map(params![object.id], row_to_version)
                .map_err(anyhow::Error::from)?
                .collect::<rusqlite::Result<_>>()
                .map_err(|e| ErrorKind::Internal(e.into()))
        })
    }

    fn current_version<'a>(
        &'a self,
        object_path: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;

            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
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

            tx.query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND is_deleted = 0 AND version_tag IS NOT NULL ORDER BY id DESC LIMIT 1"
                ),
                params![object.id],
                row_to_version,
            )
            .optional()
            .map_err(|e| ErrorKind::Internal(e.into()))
        })
    }

    fn get_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: &'a str,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ObjectVersion>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;

            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
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

            tx.query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND version_tag = ?2 AND is_deleted = 0"
                ),
                params![object.id, version_tag],
                row_to_version,
            )
            .optional()
            .map_err(|e| ErrorKind::Internal(e.into()))
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;

            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
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
            tx.execute(
                "INSERT INTO version (object_id, version_tag, nbytes, metadata, is_deleted, acl, created_at)
                 VALUES (?1, NULL, ?2, ?3, 1, ?4, ?5)",
                params![
                    object.id,
                    nbytes as i64,
                    metadata_to_json(&metadata),
                    acl_to_json(&acl),
                    now()
                ],
            )
            .map_err(anyhow::Error::from)?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(id)
        })
    }

    fn complete_version<'a>(
        &'a self,
        serial_id: i64,
        tag: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectVersion, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            tx.execute(
                "UPDATE version SET version_tag = ?1, is_deleted = 0 WHERE id = ?2",
                params![tag, serial_id],
            )
            .map_err(anyhow::Error::from)?;
            let version = tx
                .query_row(
                    &format!("SELECT {VERSION_COLUMNS} FROM version WHERE id = ?1"),
                    params![serial_id],
                    row_to_version,
                )
                .map_err(anyhow::Error::from)?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(version)
        })
    }

    fn delete_version<'a>(
        &'a self,
        object_path: &'a str,
        version_tag: Option<&'a str>,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<VersionDeleteCleanup, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;
            let object_ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;

            let versions: Vec<ObjectVersion> = match version_tag {
                Some(tag) => {
                    let v = tx
                        .query_row(
                            &format!(
                                "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND version_tag = ?2 AND is_deleted = 0"
                            ),
                            params![object.id, tag],
                            row_to_version,
                        )
                        .optional()
                        .map_err(anyhow::Error::from)?
                        .ok_or_else(|| ErrorKind::NotFound(format!("version '{tag}' not found")))?;
                    vec![v]
                }
                None => {
                    let mut stmt = tx
                        .prepare(&format!(
                            "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND is_deleted = 0"
                        ))
                        .map_err(anyhow::Error::from)?;
                    stmt.query_map(params![object.id], row_to_version)
                        .map_err(anyhow::Error::from)?
                        .collect::<rusqlite::Result<_>>()
                        .map_err(anyhow::Error::from)?
                }
            };

            let mut cleanup = VersionDeleteCleanup::default();
            for v in versions {
                let mut chain: Vec<&Acl> = object_ancestors.iter().collect();
                chain.push(&object.acl);
                acl::enforce(
                    &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                    &v.acl,
                    &chain,
                    ctx,
                )?;
                tx.execute("UPDATE version SET is_deleted = 1 WHERE id = ?1", params![v.id])
                    .map_err(anyhow::Error::from)?;
                if let Some(tag) = v.version_tag {
                    cleanup.versions_to_purge.push((object_path.to_string(), tag));
                }
            }

            tx.commit().map_err(anyhow::Error::from)?;
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

            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;

            match resource {
                ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
                    let row = find_name_row_by_path(&tx, path)
                        .map_err(anyhow::Error::from)?
                        .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
                    let ancestors = ancestor_acls(&tx, row.parent_id).map_err(anyhow::Error::from)?;
                    let chain: Vec<&Acl> = ancestors.iter().collect();
                    acl::enforce(
                        &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                        &row.acl,
                        &chain,
                        ctx,
                    )?;
                    let mut metadata = row.metadata;
                    apply_field(&mut metadata, field, value, write_once)?;
                    tx.execute(
                        "UPDATE name SET metadata = ?1 WHERE id = ?2",
                        params![metadata_to_json(&metadata), row.id],
                    )
                    .map_err(anyhow::Error::from)?;
                }
                ResourceRef::Version(object_path, tag) => {
                    let object = resolve_object(&tx, object_path)?;
                    let v = tx
                        .query_row(
                            &format!(
                                "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND version_tag = ?2 AND is_deleted = 0"
                            ),
                            params![object.id, tag],
                            row_to_version,
                        )
                        .map_err(anyhow::Error::from)?;
                    let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
                    let mut chain: Vec<&Acl> = ancestors.iter().collect();
                    chain.push(&object.acl);
                    acl::enforce(
                        &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                        &v.acl,
                        &chain,
                        ctx,
                    )?;
                    let mut metadata = v.metadata;
                    apply_field(&mut metadata, field, value, write_once)?;
                    tx.execute(
                        "UPDATE version SET metadata = ?1 WHERE id = ?2",
                        params![metadata_to_json(&metadata), v.id],
                    )
                    .map_err(anyhow::Error::from)?;
                }
                ResourceRef::Upload(object_path, job_token) => {
                    let object = resolve_object(&tx, object_path)?;
                    let u = tx
                        .query_row(
                            &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1 AND job_token = ?2"),
                            params![object.id, job_token],
                            row_to_upload,
                        )
                        .map_err(anyhow::Error::from)?;
                    acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
                    let mut metadata = u.metadata;
                    apply_field(&mut metadata, field, value, write_once)?;
                    tx.execute(
                        "UPDATE upload SET metadata = ?1 WHERE id = ?2",
                        params![metadata_to_json(&metadata), u.id],
                    )
                    .map_err(anyhow::Error::from)?;
                }
            }

            tx.commit().map_err(anyhow::Error::from)?;
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;

            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
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
            tx.execute(
                "INSERT INTO upload (object_id, job_token, nbytes, chunksize, metadata, acl, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    object.id,
                    job_token,
                    nbytes as i64,
                    chunksize as i64,
                    metadata_to_json(&metadata),
                    acl_to_json(&acl),
                    now()
                ],
            )
            .map_err(anyhow::Error::from)?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(anyhow::Error::from)?;

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
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            let object = resolve_object(&tx, object_path)?;
            let upload = tx
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1 AND job_token = ?2"),
                    params![object.id, job_token],
                    row_to_upload,
                )
                .optional()
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("upload '{job_token}' not found")))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &upload.acl, &[], ctx)?;
            Ok(upload)
        })
    }

    fn put_chunk_record<'a>(
        &'a self,
        upload_id: i64,
        position: u64,
        aux: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO chunk (upload_id, position, aux) VALUES (?1, ?2, ?3)
                 ON CONFLICT(upload_id, position) DO UPDATE SET aux = excluded.aux",
                params![upload_id, position as i64, aux],
            )
            .map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn get_chunk_records<'a>(
        &'a self,
        upload_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ChunkRecord>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn
                .prepare("SELECT upload_id, position, aux FROM chunk WHERE upload_id = ?1 ORDER BY position ASC")
                .map_err(anyhow::Error::from)?;
            stmt.query_map(params![upload_id], |row| {
                Ok(ChunkRecord {
                    upload_id: row.get(0)?,
                    position: row.get::<_, i64>(1)? as u64,
                    aux: row.get(2)?,
                })
            })
            .map_err(anyhow::Error::from)?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| ErrorKind::Internal(e.into()))
        })
    }

    fn finalize_upload<'a>(
        &'a self,
        upload_id: i64,
        tag: String,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectVersion, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let upload = tx
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE id = ?1"),
                    params![upload_id],
                    row_to_upload,
                )
                .optional()
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound("upload not found".into()))?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &upload.acl, &[], ctx)?;

            let owner = ctx.client_id.clone().unwrap_or_else(|| "*".to_string());
            let version_acl = crate::model::owner_acl(&owner);
            tx.execute(
                "INSERT INTO version (object_id, version_tag, nbytes, metadata, is_deleted, acl, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    upload.object_id,
                    tag,
                    upload.nbytes as i64,
                    metadata_to_json(&upload.metadata),
                    acl_to_json(&version_acl),
                    now()
                ],
            )
            .map_err(anyhow::Error::from)?;
            let version_id = tx.last_insert_rowid();

            tx.execute("DELETE FROM chunk WHERE upload_id = ?1", params![upload_id])
                .map_err(anyhow::Error::from)?;
            tx.execute("DELETE FROM upload WHERE id = ?1", params![upload_id])
                .map_err(anyhow::Error::from)?;

            let version = tx
                .query_row(
                    &format!("SELECT {VERSION_COLUMNS} FROM version WHERE id = ?1"),
                    params![version_id],
                    row_to_version,
                )
                .map_err(anyhow::Error::from)?;

            tx.commit().map_err(anyhow::Error::from)?;
            Ok(version)
        })
    }

    fn cancel_upload<'a>(
        &'a self,
        upload_id: i64,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            let upload = tx
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE id = ?1"),
                    params![upload_id],
                    row_to_upload,
                )
                .optional()
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound("upload not found".into()))?;

            let object = find_name_row_by_id(&tx, upload.object_id)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::Internal(anyhow::anyhow!("dangling upload object_id")))?;
            let ancestors = ancestor_acls(&tx, object.parent_id).map_err(anyhow::Error::from)?;
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &upload.acl,
                &chain,
                ctx,
            )?;

            tx.execute("DELETE FROM chunk WHERE upload_id = ?1", params![upload_id])
                .map_err(anyhow::Error::from)?;
            tx.execute("DELETE FROM upload WHERE id = ?1", params![upload_id])
                .map_err(anyhow::Error::from)?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn get_acl<'a>(
        &'a self,
        resource: ResourceRef<'a>,
        ctx: &'a ClientContext,
    ) -> Pin<Box<dyn Future<Output = Result<Acl, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction().map_err(anyhow::Error::from)?;
            with_resource_acl(&tx, resource, ctx, |acl, _chain| Ok(acl.clone()))
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            mutate_resource_acl(&tx, resource, ctx, |acl| {
                acl::set_role(acl, access, role);
                Ok(())
            })?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(())
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            mutate_resource_acl(&tx, resource, ctx, |acl| acl::drop_role(acl, access, role))?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(())
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
            let mut conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.transaction().map_err(anyhow::Error::from)?;
            mutate_resource_acl(&tx, resource, ctx, |acl| {
                acl::set(acl, access, roles.clone());
                Ok(())
            })?;
            tx.commit().map_err(anyhow::Error::from)?;
            Ok(())
        })
    }

    fn get_credential<'a>(
        &'a self,
        client_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CredentialRecord>, ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.query_row(
                "SELECT client_id, secret_key, display_name, active FROM credential WHERE client_id = ?1",
                params![client_id],
                |row| {
                    Ok(CredentialRecord {
                        client_id: row.get(0)?,
                        secret_key: row.get(1)?,
                        display_name: row.get(2)?,
                        active: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()
            .map_err(|e| ErrorKind::Internal(e.into()))
        })
    }

    fn put_credential<'a>(
        &'a self,
        record: CredentialRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), ErrorKind>> + Send + 'a>> {
        boxfut!({
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO credential (client_id, secret_key, display_name, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(client_id) DO UPDATE SET secret_key = excluded.secret_key,
                    display_name = excluded.display_name, active = excluded.active",
                params![
                    record.client_id,
                    record.secret_key,
                    record.display_name,
                    record.active as i64,
                    now()
                ],
            )
            .map_err(|e| ErrorKind::Internal(e.into()))?;
            Ok(())
        })
    }
}

fn apply_field(
    metadata: &mut Metadata,
    field: &str,
    value: Option<&str>,
    write_once: bool,
) -> Result<(), ErrorKind> {
    if write_once {
        if let Some(existing) = metadata.get(field) {
            match value {
                Some(v) if v == existing => return Ok(()), // idempotent no-op re-set
                _ => {
                    return Err(ErrorKind::Conflict(format!(
                        "'{field}' is write-once and already set"
                    )))
                }
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

fn with_resource_acl<'a, F, T>(
    tx: &Transaction<'a>,
    resource: ResourceRef<'_>,
    ctx: &ClientContext,
    f: F,
) -> Result<T, ErrorKind>
where
    F: FnOnce(&Acl, &[&Acl]) -> Result<T, ErrorKind>,
{
    match resource {
        ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
            let row = find_name_row_by_path(tx, path)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            let ancestors = ancestor_acls(tx, row.parent_id).map_err(anyhow::Error::from)?;
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &row.acl,
                &chain,
                ctx,
            )?;
            f(&row.acl, &chain)
        }
        ResourceRef::Version(object_path, tag) => {
            let object = resolve_object(tx, object_path)?;
            let v = tx
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND version_tag = ?2 AND is_deleted = 0"
                    ),
                    params![object.id, tag],
                    row_to_version,
                )
                .map_err(anyhow::Error::from)?;
            let ancestors = ancestor_acls(tx, object.parent_id).map_err(anyhow::Error::from)?;
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&object.acl);
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &v.acl,
                &chain,
                ctx,
            )?;
            f(&v.acl, &chain)
        }
        ResourceRef::Upload(object_path, job_token) => {
            let object = resolve_object(tx, object_path)?;
            let u = tx
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1 AND job_token = ?2"),
                    params![object.id, job_token],
                    row_to_upload,
                )
                .map_err(anyhow::Error::from)?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
            f(&u.acl, &[])
        }
    }
}

fn mutate_resource_acl<F>(
    tx: &Transaction<'_>,
    resource: ResourceRef<'_>,
    ctx: &ClientContext,
    mutator: F,
) -> Result<(), ErrorKind>
where
    F: FnOnce(&mut Acl) -> Result<(), ErrorKind>,
{
    match resource {
        ResourceRef::Namespace(path) | ResourceRef::Object(path) => {
            let row = find_name_row_by_path(tx, path)
                .map_err(anyhow::Error::from)?
                .ok_or_else(|| ErrorKind::NotFound(format!("'{path}' does not exist")))?;
            let ancestors = ancestor_acls(tx, row.parent_id).map_err(anyhow::Error::from)?;
            let chain: Vec<&Acl> = ancestors.iter().collect();
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &row.acl,
                &chain,
                ctx,
            )?;
            let mut acl = row.acl;
            mutator(&mut acl)?;
            tx.execute(
                "UPDATE name SET acl = ?1 WHERE id = ?2",
                params![acl_to_json(&acl), row.id],
            )
            .map_err(anyhow::Error::from)?;
        }
        ResourceRef::Version(object_path, tag) => {
            let object = resolve_object(tx, object_path)?;
            let v = tx
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM version WHERE object_id = ?1 AND version_tag = ?2 AND is_deleted = 0"
                    ),
                    params![object.id, tag],
                    row_to_version,
                )
                .map_err(anyhow::Error::from)?;
            let ancestors = ancestor_acls(tx, object.parent_id).map_err(anyhow::Error::from)?;
            let mut chain: Vec<&Acl> = ancestors.iter().collect();
            chain.push(&object.acl);
            acl::enforce(
                &[Requirement::Direct(Access::Owner), Requirement::AncestorOwner],
                &v.acl,
                &chain,
                ctx,
            )?;
            let mut acl = v.acl;
            mutator(&mut acl)?;
            tx.execute(
                "UPDATE version SET acl = ?1 WHERE id = ?2",
                params![acl_to_json(&acl), v.id],
            )
            .map_err(anyhow::Error::from)?;
        }
        ResourceRef::Upload(object_path, job_token) => {
            let object = resolve_object(tx, object_path)?;
            let u = tx
                .query_row(
                    &format!("SELECT {UPLOAD_COLUMNS} FROM upload WHERE object_id = ?1 AND job_token = ?2"),
                    params![object.id, job_token],
                    row_to_upload,
                )
                .map_err(anyhow::Error::from)?;
            acl::enforce(&[Requirement::Direct(Access::Owner)], &u.acl, &[], ctx)?;
            let mut acl = u.acl;
            mutator(&mut acl)?;
            tx.execute(
                "UPDATE upload SET acl = ?1 WHERE id = ?2",
                params![acl_to_json(&acl), u.id],
            )
            .map_err(anyhow::Error::from)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Subtype;

    fn store() -> SqliteDirectory {
        SqliteDirectory::new(":memory:", &["*"]).unwrap()
    }

    fn alice() -> ClientContext {
        ClientContext::authenticated("alice")
    }

    #[tokio::test]
    async fn root_exists_and_cannot_be_deleted() {
        let dir = store();
        let root = dir.resolve("/").await.unwrap().unwrap();
        assert!(root.is_root());

        let result = dir.delete_name("/", &alice()).await;
        assert!(matches!(result, Err(ErrorKind::Forbidden(_))));
    }

    #[tokio::test]
    async fn root_with_no_admin_roles_rejects_every_top_level_create() {
        let dir = SqliteDirectory::new(":memory:", &[]).unwrap();
        let result = dir.create_name("/a", Subtype::Namespace, false, &alice()).await;
        assert!(matches!(result, Err(ErrorKind::Forbidden(_))));
    }

    #[tokio::test]
    async fn root_roles_bootstrap_grants_owner_to_named_admin_only() {
        let dir = SqliteDirectory::new(":memory:", &["admin"]).unwrap();
        assert!(matches!(
            dir.create_name("/a", Subtype::Namespace, false, &alice()).await,
            Err(ErrorKind::Forbidden(_))
        ));
        dir.create_name("/a", Subtype::Namespace, false, &ClientContext::authenticated("admin"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn root_roles_bootstrap_is_idempotent_across_restarts() {
        // Re-opening the same database with a different root_roles list
        // only ever adds owners, never revokes the ones already granted.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        {
            let dir = SqliteDirectory::new(path, &["admin"]).unwrap();
            dir.create_name("/a", Subtype::Namespace, false, &ClientContext::authenticated("admin"))
                .await
                .unwrap();
        }
        let dir = SqliteDirectory::new(path, &["other-admin"]).unwrap();
        dir.create_name("/b", Subtype::Namespace, false, &ClientContext::authenticated("admin"))
            .await
            .unwrap();
        dir.create_name("/c", Subtype::Namespace, false, &ClientContext::authenticated("other-admin"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_namespace_then_object() {
        let dir = store();
        dir.create_name("/a", Subtype::Namespace, false, &alice())
            .await
            .unwrap();
        let obj = dir
            .create_name("/a/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();
        assert_eq!(obj.path, "/a/obj");
        assert_eq!(obj.ancestors, vec![1, obj.parent_id.unwrap()]);
    }

    #[tokio::test]
    async fn create_with_make_parents() {
        let dir = store();
        let obj = dir
            .create_name("/a/b/obj", Subtype::Object, true, &alice())
            .await
            .unwrap();
        assert_eq!(obj.path, "/a/b/obj");
        assert!(dir.resolve("/a").await.unwrap().is_some());
        assert!(dir.resolve("/a/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_without_make_parents_fails() {
        let dir = store();
        let result = dir.create_name("/a/obj", Subtype::Object, false, &alice()).await;
        assert!(matches!(result, Err(ErrorKind::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_create_is_conflict() {
        let dir = store();
        dir.create_name("/a", Subtype::Namespace, false, &alice())
            .await
            .unwrap();
        let result = dir.create_name("/a", Subtype::Namespace, false, &alice()).await;
        assert!(matches!(result, Err(ErrorKind::Conflict(_))));
    }

    #[tokio::test]
    async fn dotdot_segment_is_bad_request() {
        let dir = store();
        let result = dir.create_name("/a/../b", Subtype::Namespace, true, &alice()).await;
        assert!(matches!(result, Err(ErrorKind::BadRequest(_))));
    }

    #[tokio::test]
    async fn two_phase_version_visibility() {
        let dir = store();
        dir.create_name("/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();

        assert!(dir.current_version("/obj", &alice()).await.unwrap().is_none());

        let serial = dir
            .create_version("/obj", 12, Metadata::new(), &alice())
            .await
            .unwrap();
        // Still invisible: version_tag is null.
        assert!(dir.current_version("/obj", &alice()).await.unwrap().is_none());

        let version = dir.complete_version(serial, "TAG1").await.unwrap();
        assert_eq!(version.version_tag.as_deref(), Some("TAG1"));

        let current = dir.current_version("/obj", &alice()).await.unwrap().unwrap();
        assert_eq!(current.version_tag.as_deref(), Some("TAG1"));
    }

    #[tokio::test]
    async fn current_version_is_highest_serial() {
        let dir = store();
        dir.create_name("/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();

        let s1 = dir.create_version("/obj", 1, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s1, "V1").await.unwrap();
        let s2 = dir.create_version("/obj", 2, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s2, "V2").await.unwrap();

        let current = dir.current_version("/obj", &alice()).await.unwrap().unwrap();
        assert_eq!(current.version_tag.as_deref(), Some("V2"));
    }

    #[tokio::test]
    async fn delete_version_falls_back_to_previous() {
        let dir = store();
        dir.create_name("/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();
        let s1 = dir.create_version("/obj", 1, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s1, "V1").await.unwrap();
        let s2 = dir.create_version("/obj", 2, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s2, "V2").await.unwrap();

        dir.delete_version("/obj", Some("V2"), &alice()).await.unwrap();
        let current = dir.current_version("/obj", &alice()).await.unwrap().unwrap();
        assert_eq!(current.version_tag.as_deref(), Some("V1"));
    }

    #[tokio::test]
    async fn metadata_md5_write_once() {
        let dir = store();
        dir.create_name("/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();
        let s = dir.create_version("/obj", 1, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s, "V1").await.unwrap();

        dir.update_metadata_field(
            ResourceRef::Version("/obj", "V1"),
            "content-md5",
            Some("abc"),
            &alice(),
        )
        .await
        .unwrap();

        // Idempotent re-set of the same value succeeds.
        dir.update_metadata_field(
            ResourceRef::Version("/obj", "V1"),
            "content-md5",
            Some("abc"),
            &alice(),
        )
        .await
        .unwrap();

        // Overwriting with a different value fails.
        let result = dir
            .update_metadata_field(ResourceRef::Version("/obj", "V1"), "content-md5", Some("xyz"), &alice())
            .await;
        assert!(matches!(result, Err(ErrorKind::Conflict(_))));
    }

    #[tokio::test]
    async fn acl_grant_enables_foreign_reader() {
        let dir = store();
        dir.create_name("/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();
        let s = dir.create_version("/obj", 1, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s, "V1").await.unwrap();

        let bob = ClientContext::authenticated("bob");
        assert!(dir.current_version("/obj", &bob).await.is_err());

        dir.set_acl_role(ResourceRef::Object("/obj"), Access::Read, "bob", &alice())
            .await
            .unwrap();
        assert!(dir.current_version("/obj", &bob).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_subtree_enumerates_versions_and_uploads() {
        let dir = store();
        dir.create_name("/a", Subtype::Namespace, false, &alice())
            .await
            .unwrap();
        dir.create_name("/a/obj", Subtype::Object, false, &alice())
            .await
            .unwrap();
        let s = dir.create_version("/a/obj", 1, Metadata::new(), &alice()).await.unwrap();
        dir.complete_version(s, "V1").await.unwrap();
        dir.create_upload("/a/obj", "job-1".into(), 10, 20, Metadata::new(), &alice())
            .await
            .unwrap();

        let cleanup = dir.delete_name("/a", &alice()).await.unwrap();
        assert_eq!(cleanup.versions_to_purge, vec![("/a/obj".to_string(), "V1".to_string())]);
        assert_eq!(cleanup.uploads_to_cancel.len(), 1);
        assert!(dir.resolve("/a/obj").await.unwrap().is_none());
    }
}
