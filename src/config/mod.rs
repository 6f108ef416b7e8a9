//! Configuration for the embedding service.
//!
//! Settings are pure data; [`Settings::from_env`] loads them from `SAMGATE_*`
//! environment variables with defaults from [`defaults`].

pub mod defaults;
mod settings;

pub use settings::Settings;
