//! Nearest-match lookup over stored embeddings.
//!
//! Given a requested viewport extent, the index decides whether any stored
//! embedding for the same image already covers the request closely enough to
//! be reused, saving a multi-second external inference call.
//!
//! A candidate with width `w`, height `h` and origin `(cx, cy)` is reusable
//! for a request with width `W`, height `H`, origin `(x, y)` and tolerance
//! factor `f` iff its extent equals the requested extent exactly, or
//!
//! ```text
//! w < W*(1+f)  &&  h < H*(1+f)  &&
//! x*(1-f) < cx <= x  &&  y*(1-f) < cy <= y
//! ```
//!
//! The origin bands are deliberately half-open and asymmetric: a reusable
//! embedding may start below and left of the request, never above or right
//! of it. When several candidates fall inside the band, the one whose center
//! is closest to the requested center wins; ties fall back to the lowest id
//! so the result is deterministic.

use crate::extent::Extent;
use crate::store::{Embedding, EmbeddingStore, StorageError};
use std::sync::Arc;
use tracing::debug;

/// Spatial nearest-match index over an [`EmbeddingStore`].
pub struct SpatialEmbeddingIndex<S> {
    store: Arc<S>,
    tolerance: f64,
}

impl<S: EmbeddingStore> SpatialEmbeddingIndex<S> {
    /// Creates an index with the given tolerance factor.
    pub fn new(store: Arc<S>, tolerance: f64) -> Self {
        Self { store, tolerance }
    }

    /// Finds a stored embedding that satisfies the requested extent, if any.
    ///
    /// `exclude_id` removes one specific embedding from candidacy; it is set
    /// when a viewport is being refined so the embedding under refinement is
    /// never returned as its own match. Returning `None` is not an error.
    pub async fn find_reusable(
        &self,
        image_id: i64,
        requested: Extent,
        exclude_id: Option<i64>,
    ) -> Result<Option<Embedding>, StorageError> {
        let mut candidates: Vec<Embedding> = self
            .store
            .list_for_image(image_id)
            .await?
            .into_iter()
            .filter(|row| exclude_id != Some(row.id))
            .filter(|row| is_reusable(&row.extent, &requested, self.tolerance))
            .collect();

        candidates.sort_by_key(|row| row.id);
        let best = candidates.into_iter().min_by(|a, b| {
            a.extent
                .center_distance(&requested)
                .partial_cmp(&b.extent.center_distance(&requested))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(hit) = &best {
            debug!(
                image_id,
                embedding_id = hit.id,
                requested = %requested,
                serving = %hit.extent,
                "reusing stored embedding"
            );
        }
        Ok(best)
    }
}

/// Band-membership test for a single candidate extent.
pub fn is_reusable(candidate: &Extent, requested: &Extent, tolerance: f64) -> bool {
    if candidate == requested {
        return true;
    }

    let max_w = requested.width() * (1.0 + tolerance);
    let max_h = requested.height() * (1.0 + tolerance);
    let min_x = requested.x * (1.0 - tolerance);
    let min_y = requested.y * (1.0 - tolerance);

    candidate.width() < max_w
        && candidate.height() < max_h
        && candidate.x > min_x
        && candidate.x <= requested.x
        && candidate.y > min_y
        && candidate.y <= requested.y
}
