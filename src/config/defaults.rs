//! Default values for all configuration options.

/// Directory where embedding artifacts are stored.
pub const ARTIFACT_DIR: &str = "storage/embeddings";

/// Base URL under which stored artifacts are served for download.
pub const ARTIFACT_BASE_URL: &str = "/storage/embeddings";

/// URL of the external embedding worker service.
pub const WORKER_URL: &str = "http://embedding-worker";

/// Request timeout in seconds for the external embedding worker.
pub const WORKER_TIMEOUT_SECS: u64 = 60;

/// Global in-flight count above which new generations are deferred to the
/// background queue instead of running inline.
pub const QUEUE_THRESHOLD: u64 = 2;

/// Capacity of the deferred-job queue.
pub const QUEUE_CAPACITY: usize = 64;

/// Size in pixels of the longest edge the model expects of input images.
pub const MODEL_INPUT_SIZE: u32 = 1024;

/// Tolerance factor for the spatial nearest-match lookup.
pub const MATCH_TOLERANCE: f64 = 0.31;

/// Lossy encode quality of prepared image buffers.
pub const ENCODE_QUALITY: u8 = 85;

/// Age in days after which an embedding artifact is pruned.
pub const PRUNE_AGE_DAYS: i64 = 30;
