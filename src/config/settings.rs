//! Settings struct for the embedding service.

use super::defaults;
use std::path::PathBuf;
use std::time::Duration;

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory where embedding artifacts are stored.
    pub artifact_dir: PathBuf,
    /// Base URL under which artifacts are served for download.
    pub artifact_base_url: String,
    /// URL of the external embedding worker service.
    pub worker_url: String,
    /// Request timeout for the external embedding worker.
    pub worker_timeout: Duration,
    /// Global in-flight count above which generations are deferred.
    pub queue_threshold: u64,
    /// Capacity of the deferred-job queue.
    pub queue_capacity: usize,
    /// Longest-edge size in pixels the model expects of input images.
    pub model_input_size: u32,
    /// Tolerance factor for the spatial nearest-match lookup.
    pub match_tolerance: f64,
    /// Lossy encode quality of prepared image buffers.
    pub encode_quality: u8,
    /// Age in days after which embedding artifacts are pruned.
    pub prune_age_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(defaults::ARTIFACT_DIR),
            artifact_base_url: defaults::ARTIFACT_BASE_URL.to_string(),
            worker_url: defaults::WORKER_URL.to_string(),
            worker_timeout: Duration::from_secs(defaults::WORKER_TIMEOUT_SECS),
            queue_threshold: defaults::QUEUE_THRESHOLD,
            queue_capacity: defaults::QUEUE_CAPACITY,
            model_input_size: defaults::MODEL_INPUT_SIZE,
            match_tolerance: defaults::MATCH_TOLERANCE,
            encode_quality: defaults::ENCODE_QUALITY,
            prune_age_days: defaults::PRUNE_AGE_DAYS,
        }
    }
}

impl Settings {
    /// Loads settings from `SAMGATE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            artifact_dir: env_var("SAMGATE_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.artifact_dir),
            artifact_base_url: env_var("SAMGATE_ARTIFACT_BASE_URL").unwrap_or(base.artifact_base_url),
            worker_url: env_var("SAMGATE_WORKER_URL").unwrap_or(base.worker_url),
            worker_timeout: env_parse("SAMGATE_WORKER_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(base.worker_timeout),
            queue_threshold: env_parse("SAMGATE_QUEUE_THRESHOLD").unwrap_or(base.queue_threshold),
            queue_capacity: env_parse("SAMGATE_QUEUE_CAPACITY").unwrap_or(base.queue_capacity),
            model_input_size: env_parse("SAMGATE_MODEL_INPUT_SIZE").unwrap_or(base.model_input_size),
            match_tolerance: env_parse("SAMGATE_MATCH_TOLERANCE").unwrap_or(base.match_tolerance),
            encode_quality: env_parse("SAMGATE_ENCODE_QUALITY").unwrap_or(base.encode_quality),
            prune_age_days: env_parse("SAMGATE_PRUNE_AGE_DAYS").unwrap_or(base.prune_age_days),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}
