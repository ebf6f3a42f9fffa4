//! Version lifecycle coordination (C4, §4.4): the single-PUT path that
//! ties [`MetadataDirectory`] and [`StorageBackend`] together through
//! the two-phase visibility flip.
//!
//! ```text
//! resolve/create name -> create_version (invisible) -> stream bytes to
//! backend -> complete_version(tag)
//! ```
//!
//! A failure anywhere before the final `complete_version` leaves the
//! tombstone row in place; nothing ever makes a partially written
//! version visible.

use crate::context::ClientContext;
use crate::directory::MetadataDirectory;
use crate::errors::ErrorKind;
use crate::model::{Metadata, ObjectVersion, Subtype};
use crate::storage::backend::{ByteStream, StorageBackend};

/// Runs §4.4 end to end. `object_path` must already resolve to a name;
/// if it does not, and `create_if_missing` is set, a new object is
/// created in the same call (its own transaction, per the directory's
/// re-resolve pattern — the two are not atomic with each other, matching
/// the source behavior of "create-then-version" rather than a single
/// combined statement).
pub async fn put_version(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    create_if_missing: bool,
    stream: ByteStream,
    nbytes: u64,
    metadata: Metadata,
    ctx: &ClientContext,
) -> Result<ObjectVersion, ErrorKind> {
    let existing = directory.resolve(object_path).await?;
    match existing {
        Some(name) if name.subtype != Subtype::Object => {
            return Err(ErrorKind::Conflict(format!("'{object_path}' is not an object")));
        }
        Some(_) => {}
        None if create_if_missing => {
            directory.create_name(object_path, Subtype::Object, false, ctx).await?;
        }
        None => {
            return Err(ErrorKind::NotFound(format!("'{object_path}' does not exist")));
        }
    }

    let serial = directory
        .create_version(object_path, nbytes, metadata.clone(), ctx)
        .await?;

    let tag = match storage.create_from_file(object_path, stream, nbytes, &metadata).await {
        Ok(tag) => tag,
        Err(e) => {
            tracing::warn!(object_path, serial, error = %e, "bulk write failed, leaving tombstone version");
            return Err(ErrorKind::Internal(e));
        }
    };

    directory.complete_version(serial, &tag).await
}

/// §4.4 step 5/§5 "delete a version": remove the directory row(s) first,
/// then best-effort purge the backend bytes. Backend failures are
/// logged, not surfaced — the directory record is already gone and the
/// bytes are now orphaned garbage, same as any crash between the two
/// steps (§9 crash-only).
pub async fn delete_version(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    version_tag: Option<&str>,
    ctx: &ClientContext,
) -> Result<(), ErrorKind> {
    let cleanup = directory.delete_version(object_path, version_tag, ctx).await?;
    for (path, tag) in cleanup.versions_to_purge {
        if let Err(e) = storage.delete(&path, &tag, None).await {
            tracing::warn!(path, tag, error = %e, "failed to purge backend bytes for deleted version");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};

    fn owner_ctx() -> ClientContext {
        ClientContext::authenticated("alice")
    }

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn put_version_creates_object_when_missing() {
        let directory = MemoryDirectory::new(&["*"]);
        let storage = MemoryBackend::new();
        let ctx = owner_ctx();
        directory.create_name("/a", Subtype::Namespace, false, &ctx).await.unwrap();

        let version = put_version(
            &directory,
            &storage,
            "/a/obj",
            true,
            bytes_stream(b"hello"),
            5,
            Metadata::new(),
            &ctx,
        )
        .await
        .unwrap();

        assert!(version.is_visible());
        let current = directory.current_version("/a/obj", &ctx).await.unwrap().unwrap();
        assert_eq!(current.version_tag, version.version_tag);
    }

    #[tokio::test]
    async fn put_version_fails_when_missing_and_not_allowed_to_create() {
        let directory = MemoryDirectory::new(&["*"]);
        let storage = MemoryBackend::new();
        let ctx = owner_ctx();

        let err = put_version(
            &directory,
            &storage,
            "/a/obj",
            false,
            bytes_stream(b"hello"),
            5,
            Metadata::new(),
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn second_put_supersedes_first_as_current() {
        let directory = MemoryDirectory::new(&["*"]);
        let storage = MemoryBackend::new();
        let ctx = owner_ctx();
        directory.create_name("/a/obj", Subtype::Object, true, &ctx).await.unwrap();

        put_version(&directory, &storage, "/a/obj", false, bytes_stream(b"v1"), 2, Metadata::new(), &ctx)
            .await
            .unwrap();
        let second = put_version(&directory, &storage, "/a/obj", false, bytes_stream(b"v2!"), 3, Metadata::new(), &ctx)
            .await
            .unwrap();

        let current = directory.current_version("/a/obj", &ctx).await.unwrap().unwrap();
        assert_eq!(current.version_tag, second.version_tag);
        assert_eq!(directory.enumerate_versions("/a/obj", &ctx).await.unwrap().len(), 2);
    }
}
