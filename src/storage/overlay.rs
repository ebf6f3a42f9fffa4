//! Overlay storage backend (§4.6): a prioritized list of sub-backends.
//! Writes go to the first; reads try each in order and accept the
//! first that does not raise `ObjectVersionMissing`.

use std::future::Future;
use std::pin::Pin;

use crate::model::{ChunkRecord, Metadata};

use super::backend::{is_missing, ByteSlice, ByteStream, ContentRange, StorageBackend};

pub struct OverlayBackend {
    backends: Vec<Box<dyn StorageBackend>>,
}

impl OverlayBackend {
    pub fn new(backends: Vec<Box<dyn StorageBackend>>) -> anyhow::Result<Self> {
        if backends.is_empty() {
            anyhow::bail!("overlay backend requires at least one sub-backend");
        }
        Ok(Self { backends })
    }

    fn primary(&self) -> &dyn StorageBackend {
        self.backends[0].as_ref()
    }
}

impl StorageBackend for OverlayBackend {
    fn tracks_chunks(&self) -> bool {
        self.primary().tracks_chunks()
    }

    fn create_from_file<'a>(
        &'a self,
        name: &'a str,
        stream: ByteStream,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        self.primary().create_from_file(name, stream, nbytes, metadata)
    }

    fn create_upload<'a>(
        &'a self,
        name: &'a str,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        self.primary().create_upload(name, nbytes, metadata)
    }

    fn upload_chunk_from_file<'a>(
        &'a self,
        name: &'a str,
        job: &'a str,
        position: u64,
        chunksize: u64,
        stream: ByteStream,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + 'a>> {
        self.primary()
            .upload_chunk_from_file(name, job, position, chunksize, stream, nbytes, metadata)
    }

    fn finalize_upload<'a>(
        &'a self,
        name: &'a str,
        job: &'a str,
        chunks: Option<&'a [ChunkRecord]>,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        self.primary().finalize_upload(name, job, chunks, metadata)
    }

    fn cancel_upload<'a>(&'a self, name: &'a str, job: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.primary().cancel_upload(name, job)
    }

    fn get_content_range<'a>(
        &'a self,
        name: &'a str,
        version_tag: &'a str,
        metadata: &'a Metadata,
        slice: Option<ByteSlice>,
        aux: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ContentRange>> + Send + 'a>> {
        Box::pin(async move {
            let mut last_err = None;
            for backend in &self.backends {
                match backend.get_content_range(name, version_tag, metadata, slice, aux).await {
                    Ok(range) => return Ok(range),
                    Err(e) if is_missing(&e) => {
                        last_err = Some(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last_err.unwrap_or_else(|| crate::errors::ErrorKind::ObjectVersionMissing.into()))
        })
    }

    fn delete<'a>(&'a self, name: &'a str, version_tag: &'a str, aux: Option<&'a str>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.primary().delete(name, version_tag, aux)
    }

    fn delete_namespace<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self.primary().delete_namespace(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        stream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn reads_fall_through_to_secondary_backend() {
        let primary = MemoryBackend::new();
        let secondary = MemoryBackend::new();
        let tag = secondary
            .create_from_file("/a/obj", bytes_stream(b"hi"), 2, &Metadata::new())
            .await
            .unwrap();

        let overlay = OverlayBackend::new(vec![Box::new(primary), Box::new(secondary)]).unwrap();
        let range = overlay
            .get_content_range("/a/obj", &tag, &Metadata::new(), None, None)
            .await
            .unwrap();
        assert_eq!(range.nbytes, 2);
    }

    #[tokio::test]
    async fn missing_everywhere_surfaces_object_version_missing() {
        let overlay = OverlayBackend::new(vec![Box::new(MemoryBackend::new()), Box::new(MemoryBackend::new())]).unwrap();
        let err = overlay
            .get_content_range("/a/obj", "nope", &Metadata::new(), None, None)
            .await
            .unwrap_err();
        assert!(is_missing(&err));
    }
}
