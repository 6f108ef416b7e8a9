//! Samgate - embedding reuse and admission control for interactive
//! segmentation.
//!
//! This library manages the lifecycle of viewport image embeddings: it
//! decides whether a stored embedding can be reused for a requested
//! viewport, throttles how many generations run at once, prepares image
//! crops for the model, streams encoder output to artifact storage and
//! notifies users when deferred generations finish.
//!
//! # High-Level API
//!
//! The [`workflow`] module provides the orchestrating facade:
//!
//! ```ignore
//! use samgate::config::Settings;
//! use samgate::workflow::GenerationWorkflow;
//!
//! let settings = Settings::from_env();
//! let (workflow, worker) =
//!     GenerationWorkflow::start(store, artifacts, inference, notifier, counters, &settings);
//!
//! let outcome = workflow
//!     .handle_request(user_id, &image, source, &request)
//!     .await?;
//! ```

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod extent;
pub mod index;
pub mod inference;
pub mod logging;
pub mod notify;
pub mod prepare;
pub mod request;
pub mod store;
pub mod workflow;

pub use error::EmbeddingError;
pub use extent::Extent;

/// Version of the samgate library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
