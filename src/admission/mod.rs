//! Admission control for embedding generation.
//!
//! Tracks global and per-user in-flight counts and decides, for every cache
//! miss, whether the computation runs inline, is deferred to the background
//! queue, or is rejected. Synchronous execution is only permitted while
//! system load is low so the blocking-call latency stays bounded for
//! interactive use; above the threshold all new work is queued.
//!
//! The counters are the only mutable shared state in the system. They live
//! behind the [`CounterStore`] trait so a shared store (visible to every
//! process instance) can be injected; the acquire path is a single atomic
//! compare-and-increment, not a read-then-write pair.

mod counters;

pub use counters::{CounterStore, InMemoryCounterStore};

use crate::error::EmbeddingError;
use std::sync::Arc;
use tracing::debug;

/// How an admitted generation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run inline, blocking the caller for the duration of the generation.
    ExecuteNow,
    /// Enqueue for background execution; the caller is notified later.
    Defer,
}

/// Decides whether a new generation may proceed given current load.
pub struct AdmissionController<C> {
    counters: Arc<C>,
    queue_threshold: u64,
}

/// At most one generation may be in flight per user.
const PER_USER_LIMIT: u64 = 1;

impl<C: CounterStore> AdmissionController<C> {
    pub fn new(counters: Arc<C>, queue_threshold: u64) -> Self {
        Self {
            counters,
            queue_threshold,
        }
    }

    /// Admits a generation for `user_id` or rejects it with a rate-limit
    /// error. On success both counters have been incremented and the caller
    /// owes a matching [`release`](Self::release) once the generation
    /// finishes, successful or not.
    pub fn admit(&self, user_id: i64) -> Result<Admission, EmbeddingError> {
        let pending = match self.counters.try_acquire_user(user_id, PER_USER_LIMIT) {
            Ok(count) => count,
            Err(pending) => {
                debug!(user_id, pending, "generation rejected, user saturated");
                return Err(EmbeddingError::RateLimited { pending });
            }
        };

        let global = self.counters.increment_global();
        let admission = if global <= self.queue_threshold {
            Admission::ExecuteNow
        } else {
            Admission::Defer
        };
        debug!(user_id, pending, global, ?admission, "generation admitted");
        Ok(admission)
    }

    /// Releases the counters held by an admitted generation. Safe to call
    /// even if a counter was lost (e.g. after a store reset); counts clamp
    /// at zero instead of going negative.
    pub fn release(&self, user_id: i64) {
        self.counters.release_user(user_id);
        self.counters.decrement_global();
    }

    /// Current global in-flight count.
    pub fn global_in_flight(&self) -> u64 {
        self.counters.global_in_flight()
    }
}
