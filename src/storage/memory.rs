//! In-process fake storage backend (ambient test tooling).
//!
//! Mirrors [`super::filesystem::FilesystemBackend`]'s semantics without
//! touching disk, so handler- and lifecycle-level tests don't pay
//! filesystem setup cost.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;

use crate::model::{ChunkRecord, Metadata};

use super::backend::{ByteSlice, ByteStream, ContentRange, RangeBody, StorageBackend};

#[derive(Default)]
struct State {
    versions: std::collections::HashMap<String, Bytes>,
    uploads: std::collections::HashMap<String, BTreeMap<u64, Bytes>>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_tag() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

fn key(name: &str, tag: &str) -> String {
    format!("{name}:{tag}")
}

async fn drain(mut stream: ByteStream) -> anyhow::Result<(Bytes, String, String)> {
    let mut buf = Vec::new();
    let mut sha = Sha256::new();
    let mut md5 = Md5::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        sha.update(&chunk);
        md5.update(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok((Bytes::from(buf), hex::encode(sha.finalize()), hex::encode(md5.finalize())))
}

fn verify(metadata: &Metadata, sha_hex: &str, md5_hex: &str) -> anyhow::Result<()> {
    if let Some(declared) = metadata.get("content-sha256") {
        if declared != sha_hex {
            anyhow::bail!(crate::errors::ErrorKind::BadRequest(
                "content-sha256 does not match persisted bytes".into()
            ));
        }
    }
    if let Some(declared) = metadata.get("content-md5") {
        if declared != md5_hex {
            anyhow::bail!(crate::errors::ErrorKind::BadRequest(
                "content-md5 does not match persisted bytes".into()
            ));
        }
    }
    Ok(())
}

fn bytes_to_stream(b: Bytes, start: u64, len: u64) -> ByteStream {
    let slice = b.slice(start as usize..(start + len) as usize);
    stream::once(async move { Ok(slice) }).boxed()
}

impl StorageBackend for MemoryBackend {
    fn tracks_chunks(&self) -> bool {
        false
    }

    fn create_from_file<'a>(
        &'a self,
        name: &'a str,
        stream: ByteStream,
        nbytes: u64,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let (bytes, sha_hex, md5_hex) = drain(stream).await?;
            if bytes.len() as u64 != nbytes {
                anyhow::bail!(crate::errors::ErrorKind::BadRequest(format!(
                    "declared {nbytes} bytes but received {}",
                    bytes.len()
                )));
            }
            verify(metadata, &sha_hex, &md5_hex)?;
            let tag = new_tag();
            self.state.lock().unwrap().versions.insert(key(name, &tag), bytes);
            Ok(tag)
        })
    }

    fn create_upload<'a>(
        &'a self,
        _name: &'a str,
        _nbytes: u64,
        _metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let mut rand_bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut rand_bytes);
            let job = hex::encode(rand_bytes);
            self.state.lock().unwrap().uploads.insert(job.clone(), BTreeMap::new());
            Ok(job)
        })
    }

    fn upload_chunk_from_file<'a>(
        &'a self,
        _name: &'a str,
        job: &'a str,
        position: u64,
        _chunksize: u64,
        stream: ByteStream,
        nbytes: u64,
        _metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let (bytes, _, _) = drain(stream).await?;
            if bytes.len() as u64 != nbytes {
                anyhow::bail!(crate::errors::ErrorKind::Conflict(format!(
                    "declared chunk size {nbytes} but received {}",
                    bytes.len()
                )));
            }
            let mut state = self.state.lock().unwrap();
            let chunks = state
                .uploads
                .get_mut(job)
                .ok_or_else(|| anyhow::anyhow!("unknown upload job"))?;
            chunks.insert(position, bytes);
            Ok(None)
        })
    }

    fn finalize_upload<'a>(
        &'a self,
        name: &'a str,
        job: &'a str,
        _chunks: Option<&'a [ChunkRecord]>,
        metadata: &'a Metadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let mut assembled = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                let chunks = state
                    .uploads
                    .remove(job)
                    .ok_or_else(|| anyhow::anyhow!("unknown upload job"))?;
                for (_, chunk) in chunks {
                    assembled.extend_from_slice(&chunk);
                }
            }
            let mut sha = Sha256::new();
            let mut md5 = Md5::new();
            sha.update(&assembled);
            md5.update(&assembled);
            verify(metadata, &hex::encode(sha.finalize()), &hex::encode(md5.finalize()))?;

            let tag = new_tag();
            self.state
                .lock()
                .unwrap()
                .versions
                .insert(key(name, &tag), Bytes::from(assembled));
            Ok(tag)
        })
    }

    fn cancel_upload<'a>(
        &'a self,
        _name: &'a str,
        job: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().unwrap().uploads.remove(job);
            Ok(())
        })
    }

    fn get_content_range<'a>(
        &'a self,
        name: &'a str,
        version_tag: &'a str,
        metadata: &'a Metadata,
        slice: Option<ByteSlice>,
        _aux: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ContentRange>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = {
                let state = self.state.lock().unwrap();
                state
                    .versions
                    .get(&key(name, version_tag))
                    .cloned()
                    .ok_or_else(|| anyhow::Error::new(crate::errors::ErrorKind::ObjectVersionMissing))?
            };
            let total = bytes.len() as u64;
            let (start, stop, out_metadata) = match slice {
                None => (0u64, total, metadata.clone()),
                Some(s) => {
                    let stop = std::cmp::min(s.stop, total);
                    let mut stripped = Metadata::new();
                    if let Some(ct) = metadata.get("content-type") {
                        stripped.insert("content-type".to_string(), ct.clone());
                    }
                    (s.start, stop, stripped)
                }
            };
            let len = stop.saturating_sub(start);
            Ok(ContentRange {
                nbytes: len,
                metadata: out_metadata,
                body: RangeBody::Bytes(bytes_to_stream(bytes, start, len)),
            })
        })
    }

    fn delete<'a>(
        &'a self,
        name: &'a str,
        version_tag: &'a str,
        _aux: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.state.lock().unwrap().versions.remove(&key(name, version_tag));
            Ok(())
        })
    }

    fn delete_namespace<'a>(&'a self, _name: &'a str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream as fstream;

    fn bytes_stream(data: &'static [u8]) -> ByteStream {
        fstream::once(async move { Ok(Bytes::from_static(data)) }).boxed()
    }

    #[tokio::test]
    async fn round_trips_full_object() {
        let backend = MemoryBackend::new();
        let tag = backend
            .create_from_file("/a/obj", bytes_stream(b"hello"), 5, &Metadata::new())
            .await
            .unwrap();
        let range = backend
            .get_content_range("/a/obj", &tag, &Metadata::new(), None, None)
            .await
            .unwrap();
        assert_eq!(range.nbytes, 5);
    }

    #[tokio::test]
    async fn missing_version_surfaces_object_version_missing() {
        let backend = MemoryBackend::new();
        let err = backend
            .get_content_range("/a/obj", "nonexistent", &Metadata::new(), None, None)
            .await
            .unwrap_err();
        assert!(super::super::backend::is_missing(&err));
    }
}
