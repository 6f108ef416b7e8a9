//! Job model for embedding generation.

use crate::extent::Extent;
use crate::prepare::SourceImage;
use crate::store::ImageRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global counter for generating unique job ids.
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a generation job within the process lifetime.
///
/// Used to correlate log messages of a generation across the sync and
/// deferred paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    /// Creates a new unique job id.
    pub fn new() -> Self {
        Self(JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "embed-{}", self.0)
    }
}

/// One admitted embedding generation.
///
/// Jobs run either inline on the caller's task or on the deferred-job
/// worker; both paths execute the same prepare/invoke/persist sequence.
#[derive(Debug, Clone)]
pub struct GenerateJob {
    pub id: JobId,
    /// User the generation is charged to and notified on.
    pub user_id: i64,
    pub image: ImageRecord,
    pub extent: Extent,
    pub source: SourceImage,
    pub created_at: Instant,
}

impl GenerateJob {
    pub fn new(user_id: i64, image: ImageRecord, extent: Extent, source: SourceImage) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            image,
            extent,
            source,
            created_at: Instant::now(),
        }
    }

    /// Elapsed time since the job was created.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique_and_monotonic() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_job_id_display() {
        let id = JobId(42);
        assert_eq!(format!("{}", id), "embed-42");
    }

    #[test]
    fn test_job_tracks_age() {
        let job = GenerateJob::new(
            1,
            ImageRecord {
                id: 1,
                uuid: "a1b2c3d4".to_string(),
                width: 100,
                height: 100,
                tiled: false,
            },
            Extent::new(0.0, 100.0, 100.0, 0.0),
            SourceImage::Simple(bytes::Bytes::new()),
        );
        assert!(job.elapsed() < Duration::from_secs(1));
    }
}
