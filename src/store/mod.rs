//! Persistent registry of image embeddings and their artifacts.
//!
//! An [`Embedding`] maps `(image, extent)` to a stored artifact file. Rows
//! are created only by the generation workflow after a successful inference
//! call, never mutated afterwards, and deleted only when the owning image is
//! deleted or the artifact is pruned.
//!
//! The metadata registry and the artifact blobs live behind the
//! [`EmbeddingStore`] and [`ArtifactStore`] traits so that the workflow can
//! be exercised against in-memory fakes.

mod artifact;
mod memory;

pub use artifact::{artifact_filename, fragment_path, FsArtifactStore, MemoryArtifactStore};
pub use memory::InMemoryEmbeddingStore;

use crate::extent::Extent;
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Sink an inference response is streamed into.
pub type ArtifactSink = dyn AsyncWrite + Send + Unpin;

/// Errors from metadata or artifact persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Artifact I/O failed.
    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An embedding row that should exist is missing.
    #[error("embedding {0} not found")]
    MissingEmbedding(i64),

    /// An artifact file that should exist is missing.
    #[error("artifact {0} not found")]
    MissingArtifact(String),
}

/// A persisted embedding row.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// Unique identifier, assigned on creation.
    pub id: i64,
    /// Owning image. Many embeddings can exist per image.
    pub image_id: i64,
    /// Spatial extent the embedding was computed for.
    pub extent: Extent,
    /// Deterministic artifact filename, derived from `(image_id, extent)`.
    pub filename: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Data for a new embedding row.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub image_id: i64,
    pub extent: Extent,
    pub filename: String,
}

/// Result of an insert attempt.
///
/// `(image_id, x, y, x2, y2)` is unique at the store level. When two admitted
/// requests race for the same viewport, the second insert resolves to
/// `Existing` with the winner's row instead of failing.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// A new row was created.
    Created(Embedding),
    /// An identical row already existed; it is returned for reuse.
    Existing(Embedding),
}

impl InsertOutcome {
    /// Returns the embedding row regardless of who created it.
    pub fn into_embedding(self) -> Embedding {
        match self {
            InsertOutcome::Created(e) | InsertOutcome::Existing(e) => e,
        }
    }
}

/// The image an embedding belongs to, as far as this crate needs to know it.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: i64,
    /// Stable identifier used to derive the artifact directory.
    pub uuid: String,
    pub width: u32,
    pub height: u32,
    /// Whether the image is stored as zoomify tiles.
    pub tiled: bool,
}

/// Registry of embedding rows.
pub trait EmbeddingStore: Send + Sync {
    /// Inserts a row, resolving duplicate `(image_id, extent)` inserts to the
    /// existing row. Implementations must make this race-safe under
    /// concurrent identical requests.
    fn insert(&self, new: NewEmbedding)
        -> impl Future<Output = Result<InsertOutcome, StorageError>> + Send;

    /// Looks up a row by id.
    fn get(&self, id: i64) -> impl Future<Output = Result<Option<Embedding>, StorageError>> + Send;

    /// Returns all rows stored for an image.
    fn list_for_image(
        &self,
        image_id: i64,
    ) -> impl Future<Output = Result<Vec<Embedding>, StorageError>> + Send;

    /// Deletes all rows for an image and returns them.
    fn delete_for_image(
        &self,
        image_id: i64,
    ) -> impl Future<Output = Result<Vec<Embedding>, StorageError>> + Send;

    /// Deletes all rows created before `cutoff` and returns them.
    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Embedding>, StorageError>> + Send;
}

/// Blob storage for embedding artifacts.
///
/// Artifacts are addressed by the owning image's uuid and the deterministic
/// filename so that cleanup of an image maps to removing one directory.
pub trait ArtifactStore: Send + Sync {
    /// Opens a writer for a new artifact. The artifact becomes visible once
    /// the writer is shut down.
    fn open_writer(
        &self,
        image_uuid: &str,
        filename: &str,
    ) -> impl Future<Output = Result<Box<ArtifactSink>, StorageError>> + Send;

    /// Reads a stored artifact.
    fn read(
        &self,
        image_uuid: &str,
        filename: &str,
    ) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;

    /// Deletes a single artifact. Deleting a missing artifact is not an
    /// error.
    fn delete(
        &self,
        image_uuid: &str,
        filename: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Deletes the artifact directory of an image.
    fn delete_image(&self, image_uuid: &str)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Returns the download locator for a stored artifact.
    fn url(&self, image_uuid: &str, filename: &str) -> String;
}
