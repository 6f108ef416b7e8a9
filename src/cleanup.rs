//! Cascading cleanup and age-based pruning of embeddings.
//!
//! Embeddings are deleted only as a side effect of their image being
//! deleted, or when their artifact has outlived the configured retention
//! age. Both operations remove rows and artifacts together.

use crate::store::{ArtifactStore, Embedding, EmbeddingStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// Removes all embeddings of the given images: rows and the per-image
/// artifact directories. Returns the number of deleted rows.
pub async fn cleanup_image_embeddings<S, A>(
    store: &S,
    artifacts: &A,
    images: &[(i64, String)],
) -> Result<usize, StorageError>
where
    S: EmbeddingStore,
    A: ArtifactStore,
{
    let mut deleted = 0;
    for (image_id, uuid) in images {
        let removed = store.delete_for_image(*image_id).await?;
        deleted += removed.len();
        artifacts.delete_image(uuid).await?;
        if !removed.is_empty() {
            info!(image_id, count = removed.len(), "cleaned up image embeddings");
        }
    }
    Ok(deleted)
}

/// Deletes embeddings older than `max_age`, resolving each row's artifact
/// through `uuid_of`. A missing artifact is logged and skipped; the row is
/// gone either way. Returns the number of pruned rows.
pub async fn prune_stale_embeddings<S, A, F>(
    store: &S,
    artifacts: &A,
    max_age: Duration,
    now: DateTime<Utc>,
    uuid_of: F,
) -> Result<usize, StorageError>
where
    S: EmbeddingStore,
    A: ArtifactStore,
    F: Fn(&Embedding) -> Option<String>,
{
    let cutoff = now - max_age;
    let removed = store.delete_older_than(cutoff).await?;

    for row in &removed {
        match uuid_of(row) {
            Some(uuid) => artifacts.delete(&uuid, &row.filename).await?,
            None => warn!(
                embedding_id = row.id,
                image_id = row.image_id,
                "owning image unknown, leaving artifact behind"
            ),
        }
    }

    if !removed.is_empty() {
        info!(count = removed.len(), %cutoff, "pruned stale embeddings");
    }
    Ok(removed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;
    use crate::store::{InMemoryEmbeddingStore, MemoryArtifactStore, NewEmbedding};
    use tokio::io::AsyncWriteExt;

    async fn seed(
        store: &InMemoryEmbeddingStore,
        artifacts: &MemoryArtifactStore,
        image_id: i64,
        uuid: &str,
        extent: Extent,
    ) {
        let filename = crate::store::artifact_filename(image_id, &extent);
        let mut w = artifacts.open_writer(uuid, &filename).await.unwrap();
        w.write_all(b"npy").await.unwrap();
        w.shutdown().await.unwrap();
        store
            .insert(NewEmbedding {
                image_id,
                extent,
                filename,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_rows_and_artifacts() {
        let store = InMemoryEmbeddingStore::new();
        let artifacts = MemoryArtifactStore::new();

        seed(&store, &artifacts, 1, "aaaa1111", Extent::new(0.0, 0.0, 10.0, 10.0)).await;
        seed(&store, &artifacts, 1, "aaaa1111", Extent::new(5.0, 5.0, 15.0, 15.0)).await;
        seed(&store, &artifacts, 2, "bbbb2222", Extent::new(0.0, 0.0, 10.0, 10.0)).await;

        let deleted =
            cleanup_image_embeddings(&store, &artifacts, &[(1, "aaaa1111".to_string())])
                .await
                .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(artifacts.len(), 1);
        assert!(store.list_for_image(2).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_prune_only_removes_old_rows() {
        let store = InMemoryEmbeddingStore::new();
        let artifacts = MemoryArtifactStore::new();
        seed(&store, &artifacts, 1, "aaaa1111", Extent::new(0.0, 0.0, 10.0, 10.0)).await;

        // Rows were just created; a 30-day retention keeps them.
        let pruned = prune_stale_embeddings(
            &store,
            &artifacts,
            Duration::days(30),
            Utc::now(),
            |_| Some("aaaa1111".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(store.len(), 1);

        // Pretend 31 days have passed.
        let pruned = prune_stale_embeddings(
            &store,
            &artifacts,
            Duration::days(30),
            Utc::now() + Duration::days(31),
            |_| Some("aaaa1111".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.is_empty());
        assert!(artifacts.is_empty());
    }
}
