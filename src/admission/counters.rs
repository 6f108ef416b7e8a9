//! In-flight counter storage.
//!
//! Counters are pure rate-limiting state: not persisted across restarts, but
//! they must be visible to every task running the generation workflow. The
//! trait is the seam for a shared implementation (e.g. Redis) when the
//! service runs as multiple processes against one counter store.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic in-flight counters, global and per user.
///
/// All operations are single-step atomics. In particular
/// [`try_acquire_user`](CounterStore::try_acquire_user) is a
/// compare-and-increment, so the check-then-act sequence of "read counter,
/// compare, then separately write" cannot lose updates under contention.
/// Decrements clamp at zero.
pub trait CounterStore: Send + Sync {
    /// Atomically increments the user's in-flight count if it is below
    /// `limit`. Returns the new count on success, or the current count when
    /// the user is already at the limit.
    fn try_acquire_user(&self, user_id: i64, limit: u64) -> Result<u64, u64>;

    /// Decrements the user's in-flight count, clamped at zero.
    fn release_user(&self, user_id: i64);

    /// Increments the global in-flight count and returns the new value.
    fn increment_global(&self) -> u64;

    /// Decrements the global in-flight count, clamped at zero.
    fn decrement_global(&self);

    /// Current global in-flight count.
    fn global_in_flight(&self) -> u64;

    /// Current in-flight count of a user.
    fn user_in_flight(&self, user_id: i64) -> u64;
}

/// Process-local [`CounterStore`] implementation.
#[derive(Default)]
pub struct InMemoryCounterStore {
    global: AtomicU64,
    users: DashMap<i64, AtomicU64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn try_acquire_user(&self, user_id: i64, limit: u64) -> Result<u64, u64> {
        let entry = self.users.entry(user_id).or_default();
        let counter = entry.value();
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Err(current);
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    fn release_user(&self, user_id: i64) {
        if let Some(entry) = self.users.get(&user_id) {
            let _ = entry
                .value()
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(1))
                });
        }
    }

    fn increment_global(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn decrement_global(&self) {
        let _ = self
            .global
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn global_in_flight(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    fn user_in_flight(&self, user_id: i64) -> u64 {
        self.users
            .get(&user_id)
            .map(|entry| entry.value().load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
