//! In-memory embedding registry.
//!
//! Backs tests and single-process deployments. The interior mutex makes the
//! insert path a single critical section, which is what gives the uniqueness
//! invariant its race safety here.

use super::{Embedding, EmbeddingStore, InsertOutcome, NewEmbedding, StorageError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<Embedding>,
}

/// In-memory [`EmbeddingStore`] implementation.
#[derive(Default)]
pub struct InMemoryEmbeddingStore {
    inner: Mutex<Inner>,
}

impl InMemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn insert(&self, new: NewEmbedding) -> Result<InsertOutcome, StorageError> {
        let mut inner = self.inner.lock();

        // Uniqueness of (image_id, x, y, x2, y2): resolve a duplicate insert
        // to the existing row instead of creating a second one.
        if let Some(existing) = inner
            .rows
            .iter()
            .find(|row| row.image_id == new.image_id && row.extent == new.extent)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        inner.next_id += 1;
        let row = Embedding {
            id: inner.next_id,
            image_id: new.image_id,
            extent: new.extent,
            filename: new.filename,
            created_at: Utc::now(),
        };
        inner.rows.push(row.clone());
        Ok(InsertOutcome::Created(row))
    }

    async fn get(&self, id: i64) -> Result<Option<Embedding>, StorageError> {
        Ok(self.inner.lock().rows.iter().find(|r| r.id == id).cloned())
    }

    async fn list_for_image(&self, image_id: i64) -> Result<Vec<Embedding>, StorageError> {
        Ok(self
            .inner
            .lock()
            .rows
            .iter()
            .filter(|r| r.image_id == image_id)
            .cloned()
            .collect())
    }

    async fn delete_for_image(&self, image_id: i64) -> Result<Vec<Embedding>, StorageError> {
        let mut inner = self.inner.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = inner
            .rows
            .drain(..)
            .partition(|r| r.image_id == image_id);
        inner.rows = kept;
        Ok(removed)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Embedding>, StorageError> {
        let mut inner = self.inner.lock();
        let (removed, kept): (Vec<_>, Vec<_>) =
            inner.rows.drain(..).partition(|r| r.created_at < cutoff);
        inner.rows = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    fn new_row(image_id: i64, extent: Extent) -> NewEmbedding {
        NewEmbedding {
            image_id,
            extent,
            filename: "abc.npy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = InMemoryEmbeddingStore::new();
        let a = store
            .insert(new_row(1, Extent::new(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap()
            .into_embedding();
        let b = store
            .insert(new_row(1, Extent::new(5.0, 5.0, 15.0, 15.0)))
            .await
            .unwrap()
            .into_embedding();

        assert!(b.id > a.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_resolves_to_existing_row() {
        let store = InMemoryEmbeddingStore::new();
        let extent = Extent::new(100.0, 100.0, 200.0, 200.0);

        let first = store.insert(new_row(1, extent)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));

        let second = store.insert(new_row(1, extent)).await.unwrap();
        match second {
            InsertOutcome::Existing(row) => {
                assert_eq!(row.id, first.into_embedding().id);
            }
            InsertOutcome::Created(_) => panic!("duplicate insert created a second row"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_extent_different_image_is_not_a_duplicate() {
        let store = InMemoryEmbeddingStore::new();
        let extent = Extent::new(0.0, 0.0, 10.0, 10.0);

        store.insert(new_row(1, extent)).await.unwrap();
        let outcome = store.insert(new_row(2, extent)).await.unwrap();

        assert!(matches!(outcome, InsertOutcome::Created(_)));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_for_image() {
        let store = InMemoryEmbeddingStore::new();
        store
            .insert(new_row(1, Extent::new(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap();
        store
            .insert(new_row(2, Extent::new(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap();

        let removed = store.delete_for_image(1).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.list_for_image(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = InMemoryEmbeddingStore::new();
        store
            .insert(new_row(1, Extent::new(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap();

        let removed = store
            .delete_older_than(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(removed.is_empty());

        let removed = store
            .delete_older_than(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.is_empty());
    }
}
