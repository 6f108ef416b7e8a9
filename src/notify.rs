//! Completion and failure notifications for deferred generations.
//!
//! The workflow reports deferred results over a per-user channel. The
//! transport (websockets, pub/sub) is an external collaborator; this module
//! only defines the dispatch contract and a logging fallback.

use serde::Serialize;
use std::future::Future;
use tracing::{info, warn};

/// Payload of a success notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingReady {
    /// Id of the persisted embedding.
    pub id: i64,
    /// Download locator for the artifact.
    pub url: String,
    /// Extent the embedding was computed for.
    pub extent: [f64; 4],
}

/// Delivers generation outcomes to the requesting user's channel.
pub trait NotificationDispatcher: Send + Sync {
    /// Announces a finished embedding to the user.
    fn notify_success(
        &self,
        user_id: i64,
        payload: EmbeddingReady,
    ) -> impl Future<Output = ()> + Send;

    /// Announces a failed generation to the user. Carries no detail; a
    /// single failed attempt is final and the user decides to resubmit.
    fn notify_failure(&self, user_id: i64) -> impl Future<Output = ()> + Send;
}

/// Dispatcher that only logs. Useful as a default when no transport is
/// wired up (e.g. in tools and tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    async fn notify_success(&self, user_id: i64, payload: EmbeddingReady) {
        info!(
            user_id,
            embedding_id = payload.id,
            url = %payload.url,
            "embedding available"
        );
    }

    async fn notify_failure(&self, user_id: i64) {
        warn!(user_id, "embedding generation failed");
    }
}
