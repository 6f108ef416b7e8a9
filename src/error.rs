//! Crate-level error taxonomy.
//!
//! Subsystems define their own error enums ([`StorageError`],
//! [`PrepareError`], [`InferenceError`]); this module rolls them up into the
//! single [`EmbeddingError`] type that the generation workflow surfaces to
//! callers. Validation and authorization failures are rejected before
//! admission and never touch the in-flight counters.

use crate::inference::InferenceError;
use crate::prepare::PrepareError;
use crate::store::StorageError;
use thiserror::Error;

/// Errors surfaced by the embedding request path.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Malformed request payload (extent, tiles). Rejected before admission.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The caller may not access the referenced image. Rejected before
    /// admission. Constructed by the routing layer; access checks themselves
    /// are not part of this crate.
    #[error("no access to image {image_id}")]
    Forbidden { image_id: i64 },

    /// The user already has a generation in flight. Retryable once it
    /// finishes.
    #[error(
        "you already have {pending} embedding generation(s) running, \
         wait for it to finish before submitting a new one"
    )]
    RateLimited { pending: u64 },

    /// A referenced image or embedding does not exist.
    #[error("image {image_id} not found")]
    NotFound { image_id: i64 },

    /// Image preparation failed (unreadable source, degenerate crop).
    #[error(transparent)]
    Prepare(#[from] PrepareError),

    /// The external inference call failed or timed out.
    #[error(transparent)]
    Upstream(#[from] InferenceError),

    /// Artifact or metadata persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Unexpected internal failure (e.g. the deferred-job queue is gone).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EmbeddingError {
    /// Returns true if the caller may retry the request later without
    /// changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::RateLimited { .. })
    }
}
