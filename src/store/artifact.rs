//! Artifact blob storage.
//!
//! Artifact filenames are a content hash of `(image_id, extent)`, so two
//! requests for the same viewport resolve to the same storage location even
//! when they race. Artifacts live under a fragmented per-image directory
//! (`ab/cd/<uuid>/<hash>.npy`), so cascading cleanup of an image is a single
//! directory removal.

use super::{ArtifactSink, ArtifactStore, StorageError};
use crate::extent::Extent;
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::mem;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tracing::debug;

/// Derives the deterministic artifact filename for an `(image_id, extent)`
/// pair. Coordinates are hashed bit-exact so that only an identical extent
/// maps to the same file.
pub fn artifact_filename(image_id: i64, extent: &Extent) -> String {
    let mut hasher = Md5::new();
    hasher.update(image_id.to_le_bytes());
    for coord in extent.to_array() {
        hasher.update(coord.to_bits().to_le_bytes());
    }
    format!("{:x}.npy", hasher.finalize())
}

/// Returns the fragmented directory path for an image uuid, e.g.
/// `"a1/b2/a1b2c3..."`. Short identifiers are used as-is.
pub fn fragment_path(image_uuid: &str) -> String {
    if image_uuid.len() >= 4 && image_uuid.is_ascii() {
        format!("{}/{}/{}", &image_uuid[..2], &image_uuid[2..4], image_uuid)
    } else {
        image_uuid.to_string()
    }
}

/// Filesystem-backed artifact store.
pub struct FsArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl FsArtifactStore {
    /// Creates a store rooted at `root`. Artifact URLs are rendered below
    /// `base_url`.
    pub fn new(root: PathBuf, base_url: impl Into<String>) -> Self {
        Self {
            root,
            base_url: base_url.into(),
        }
    }

    fn path(&self, image_uuid: &str, filename: &str) -> PathBuf {
        self.root.join(fragment_path(image_uuid)).join(filename)
    }
}

impl ArtifactStore for FsArtifactStore {
    async fn open_writer(
        &self,
        image_uuid: &str,
        filename: &str,
    ) -> Result<Box<ArtifactSink>, StorageError> {
        let path = self.path(image_uuid, filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        debug!(path = %path.display(), "opened artifact writer");
        Ok(Box::new(file))
    }

    async fn read(&self, image_uuid: &str, filename: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(image_uuid, filename);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                StorageError::MissingArtifact(path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, image_uuid: &str, filename: &str) -> Result<(), StorageError> {
        let path = self.path(image_uuid, filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_image(&self, image_uuid: &str) -> Result<(), StorageError> {
        let dir = self.root.join(fragment_path(image_uuid));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn url(&self, image_uuid: &str, filename: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            fragment_path(image_uuid),
            filename
        )
    }
}

/// In-memory artifact store for tests and single-process use.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(image_uuid: &str, filename: &str) -> String {
        format!("{}/{}", fragment_path(image_uuid), filename)
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn open_writer(
        &self,
        image_uuid: &str,
        filename: &str,
    ) -> Result<Box<ArtifactSink>, StorageError> {
        Ok(Box::new(MemoryWriter {
            buf: Vec::new(),
            key: Self::key(image_uuid, filename),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    async fn read(&self, image_uuid: &str, filename: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::key(image_uuid, filename);
        self.blobs
            .get(&key)
            .map(|blob| blob.value().clone())
            .ok_or(StorageError::MissingArtifact(key))
    }

    async fn delete(&self, image_uuid: &str, filename: &str) -> Result<(), StorageError> {
        self.blobs.remove(&Self::key(image_uuid, filename));
        Ok(())
    }

    async fn delete_image(&self, image_uuid: &str) -> Result<(), StorageError> {
        let prefix = format!("{}/", fragment_path(image_uuid));
        self.blobs.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn url(&self, image_uuid: &str, filename: &str) -> String {
        format!("memory://{}", Self::key(image_uuid, filename))
    }
}

/// Writer that commits its buffer to the blob map on shutdown.
struct MemoryWriter {
    buf: Vec<u8>,
    key: String,
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = &mut *self;
        this.blobs.insert(this.key.clone(), mem::take(&mut this.buf));
        Poll::Ready(Ok(()))
    }
}
