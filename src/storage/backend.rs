//! The [`StorageBackend`] trait (C6, §4.6): the uniform byte-level
//! interface the directory coordinates against. Every method is async
//! and streams bytes rather than buffering a whole object (§9
//! "Streaming"); request/response bodies are processed in bounded
//! chunks on the order of 1-10 MiB.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::model::{ChunkRecord, Metadata};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A bounded-memory byte stream yielded by a read.
pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// A half-open byte range `[start, stop)`. `stop = nbytes` for an
/// open-ended range; `None` means the whole entity (§4.6 "Range
/// reads").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSlice {
    pub start: u64,
    pub stop: u64,
}

/// What [`StorageBackend::get_content_range`] returns instead of a body
/// when a presigned redirect is configured and the read qualifies
/// (§4.6 "Presigned redirects").
pub enum RangeBody {
    Bytes(ByteStream),
    Redirect(String),
}

/// Result of a range read: the slice's byte count, the metadata to
/// surface with it (partial reads strip everything except
/// `content-type`, §4.6), and the body itself.
pub struct ContentRange {
    pub nbytes: u64,
    pub metadata: Metadata,
    pub body: RangeBody,
}

/// Everything the core depends on from a bulk-storage implementation
/// (§4.6). `name` is always the full object path; callers never pass
/// storage-internal keys.
pub trait StorageBackend: Send + Sync + 'static {
    /// Whether this backend persists [`ChunkRecord`] rows itself (an S3
    /// gateway needs this for its ETags; the filesystem backend does
    /// not).
    fn tracks_chunks(&self) -> bool;

    /// Stream `nbytes` bytes from `stream` to durable storage under
    /// `name`, returning the freshly minted version tag.
    fn create_from_file<'a>(
        &'a self,
        name: &'a str,
        stream: ByteStream,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> BoxFut<'a, String>;

    /// Begin a multipart upload, returning an opaque job token.
    fn create_upload<'a>(
        &'a self,
        name: &'a str,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> BoxFut<'a, String>;

    /// Upload one chunk at `position`. Returns an auxiliary blob (e.g.
    /// an S3 ETag) when [`Self::tracks_chunks`] is true, `None`
    /// otherwise.
    fn upload_chunk_from_file<'a>(
        &'a self,
        name: &'a str,
        job: &'a str,
        position: u64,
        chunksize: u64,
        stream: ByteStream,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> BoxFut<'a, Option<String>>;

    /// Assemble the uploaded chunks into a durable version, returning
    /// its version tag. `chunks` is `Some` (ordered by position) iff
    /// [`Self::tracks_chunks`] is true.
    fn finalize_upload<'a>(
        &'a self,
        name: &'a str,
        job: &'a str,
        chunks: Option<&'a [ChunkRecord]>,
        metadata: &'a Metadata,
    ) -> BoxFut<'a, String>;

    /// Abort an in-progress multipart upload and discard any uploaded
    /// chunk bytes.
    fn cancel_upload<'a>(&'a self, name: &'a str, job: &'a str) -> BoxFut<'a, ()>;

    /// Read `slice` (or the whole entity, when `None`) of the version
    /// identified by `name`/`version_tag`. `aux` is the backend-defined
    /// auxiliary token recorded for the version, if any (used by the
    /// overlay backend to remember which sub-backend holds it).
    fn get_content_range<'a>(
        &'a self,
        name: &'a str,
        version_tag: &'a str,
        metadata: &'a Metadata,
        slice: Option<ByteSlice>,
        aux: Option<&'a str>,
    ) -> BoxFut<'a, ContentRange>;

    /// Permanently delete the bytes for one version.
    fn delete<'a>(&'a self, name: &'a str, version_tag: &'a str, aux: Option<&'a str>) -> BoxFut<'a, ()>;

    /// Tidy up whatever the backend associates with an emptied
    /// namespace (e.g. remove an empty directory). May be a no-op.
    fn delete_namespace<'a>(&'a self, name: &'a str) -> BoxFut<'a, ()>;
}

/// Internal-only signal used by [`crate::storage::overlay`] to mean "not
/// present in this sub-backend, try the next one" (§7). Never surfaced
/// past the overlay boundary.
pub fn is_missing(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<crate::errors::ErrorKind>(),
        Some(crate::errors::ErrorKind::ObjectVersionMissing)
    )
}
