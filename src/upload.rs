//! Upload/chunk engine coordination (C5, §4.5): resumable multipart
//! writes layered over [`MetadataDirectory`] and [`StorageBackend`].
//!
//! Chunk shape is derived once, at job-creation time, from the
//! declared `nbytes`/`chunksize`: `nchunks = nbytes / chunksize`,
//! `remainder = nbytes % chunksize`. Every chunk upload is validated
//! against that shape before it ever reaches the backend.

use crate::context::ClientContext;
use crate::directory::MetadataDirectory;
use crate::errors::ErrorKind;
use crate::model::{Metadata, ObjectVersion, UploadJob};
use crate::storage::backend::{ByteStream, StorageBackend};

/// §4.5 "Create job".
pub async fn create_upload(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    chunksize: u64,
    nbytes: u64,
    metadata: Metadata,
    ctx: &ClientContext,
) -> Result<UploadJob, ErrorKind> {
    if chunksize == 0 {
        return Err(ErrorKind::BadRequest("chunk size must be > 0".into()));
    }
    let job_token = storage
        .create_upload(object_path, nbytes, &metadata)
        .await
        .map_err(ErrorKind::Internal)?;
    directory
        .create_upload(object_path, job_token, chunksize, nbytes, metadata, ctx)
        .await
}

/// Validates `position`/`nbytes` against the job's declared chunk shape
/// (§4.5 "Upload chunk", second/third/fourth bullets).
fn validate_chunk_shape(job: &UploadJob, position: u64, nbytes: u64) -> Result<(), ErrorKind> {
    let nchunks = job.nchunks();
    let remainder = job.remainder();
    let last_position = if remainder > 0 { nchunks } else { nchunks.saturating_sub(1) };

    if position > last_position {
        return Err(ErrorKind::Conflict(format!(
            "chunk position {position} is out of range for this upload"
        )));
    }
    if remainder > 0 && position == nchunks {
        if nbytes != remainder {
            return Err(ErrorKind::Conflict(format!(
                "final chunk must be {remainder} bytes, got {nbytes}"
            )));
        }
    } else if nbytes != job.chunksize {
        return Err(ErrorKind::Conflict(format!(
            "chunk {position} must be {} bytes, got {nbytes}",
            job.chunksize
        )));
    }
    Ok(())
}

/// §4.5 "Upload chunk". Chunks may be uploaded in any order and
/// resubmitted; the backend and (when it tracks chunks) the chunk table
/// both key on position, so the last write for a position wins.
pub async fn upload_chunk(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    job_token: &str,
    position: u64,
    stream: ByteStream,
    nbytes: u64,
    metadata: Metadata,
    ctx: &ClientContext,
) -> Result<(), ErrorKind> {
    let job = directory.get_upload(object_path, job_token, ctx).await?;
    validate_chunk_shape(&job, position, nbytes)?;

    let aux = storage
        .upload_chunk_from_file(object_path, job_token, position, job.chunksize, stream, nbytes, &metadata)
        .await
        .map_err(ErrorKind::Internal)?;

    if storage.tracks_chunks() {
        let aux = aux.ok_or_else(|| {
            ErrorKind::Internal(anyhow::anyhow!(
                "backend declares tracks_chunks but returned no auxiliary blob"
            ))
        })?;
        directory.put_chunk_record(job.id, position, aux).await?;
    }
    Ok(())
}

/// §4.5 "Finalize": assemble the uploaded chunks into a durable version.
pub async fn finalize(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    job_token: &str,
    ctx: &ClientContext,
) -> Result<ObjectVersion, ErrorKind> {
    let job = directory.get_upload(object_path, job_token, ctx).await?;

    let records = if storage.tracks_chunks() {
        Some(directory.get_chunk_records(job.id).await?)
    } else {
        None
    };

    let tag = storage
        .finalize_upload(object_path, job_token, records.as_deref(), &job.metadata)
        .await
        .map_err(ErrorKind::Internal)?;

    directory.finalize_upload(job.id, tag, ctx).await
}

/// §4.5 "Cancel": drop the directory rows first, then best-effort tell
/// the backend to discard any uploaded chunk bytes.
pub async fn cancel(
    directory: &dyn MetadataDirectory,
    storage: &dyn StorageBackend,
    object_path: &str,
    job_token: &str,
    ctx: &ClientContext,
) -> Result<(), ErrorKind> {
    let job = directory.get_upload(object_path, job_token, ctx).await?;
    directory.cancel_upload(job.id, ctx).await?;
    if let Err(e) = storage.cancel_upload(object_path, job_token).await {
        tracing::warn!(object_path, job_token, error = %e, "backend failed to discard cancelled upload chunks");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::memory::MemoryDirectory;
    use crate::model::Subtype;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};

    fn owner_ctx() -> ClientContext {
        ClientContext::authenticated("alice")
    }

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    async fn setup() -> (MemoryDirectory, MemoryBackend) {
        let directory = MemoryDirectory::new(&["*"]);
        directory
            .create_name("/a/obj", Subtype::Object, true, &owner_ctx())
            .await
            .unwrap();
        (directory, MemoryBackend::new())
    }

    #[tokio::test]
    async fn full_upload_roundtrip() {
        let (directory, storage) = setup().await;
        let ctx = owner_ctx();
        // 2 full chunks of 4 bytes plus a 2-byte remainder: 10 bytes total.
        let job = create_upload(&directory, &storage, "/a/obj", 4, 10, Metadata::new(), &ctx)
            .await
            .unwrap();

        upload_chunk(&directory, &storage, "/a/obj", &job.job_token, 0, bytes_stream(b"abcd"), 4, Metadata::new(), &ctx)
            .await
            .unwrap();
        upload_chunk(&directory, &storage, "/a/obj", &job.job_token, 1, bytes_stream(b"efgh"), 4, Metadata::new(), &ctx)
            .await
            .unwrap();
        upload_chunk(&directory, &storage, "/a/obj", &job.job_token, 2, bytes_stream(b"ij"), 2, Metadata::new(), &ctx)
            .await
            .unwrap();

        let version = finalize(&directory, &storage, "/a/obj", &job.job_token, &ctx).await.unwrap();
        assert!(version.is_visible());
        assert_eq!(version.nbytes, 10);
    }

    #[tokio::test]
    async fn wrong_chunk_size_is_conflict() {
        let (directory, storage) = setup().await;
        let ctx = owner_ctx();
        let job = create_upload(&directory, &storage, "/a/obj", 4, 8, Metadata::new(), &ctx)
            .await
            .unwrap();

        let err = upload_chunk(&directory, &storage, "/a/obj", &job.job_token, 0, bytes_stream(b"abc"), 3, Metadata::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Conflict(_)));
    }

    #[tokio::test]
    async fn position_past_end_is_conflict() {
        let (directory, storage) = setup().await;
        let ctx = owner_ctx();
        let job = create_upload(&directory, &storage, "/a/obj", 4, 8, Metadata::new(), &ctx)
            .await
            .unwrap();

        let err = upload_chunk(&directory, &storage, "/a/obj", &job.job_token, 2, bytes_stream(b"abcd"), 4, Metadata::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_discards_job() {
        let (directory, storage) = setup().await;
        let ctx = owner_ctx();
        let job = create_upload(&directory, &storage, "/a/obj", 4, 8, Metadata::new(), &ctx)
            .await
            .unwrap();
        cancel(&directory, &storage, "/a/obj", &job.job_token, &ctx).await.unwrap();

        let err = directory.get_upload("/a/obj", &job.job_token, &ctx).await.unwrap_err();
        assert!(matches!(err, ErrorKind::NotFound(_)));
    }
}
