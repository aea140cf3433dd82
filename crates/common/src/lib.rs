//! ModelServe common library
//!
//! This crate contains shared code used across ModelServe components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ServeConfig;
pub use error::{Result, ServeError};
pub use metrics::{MetricsRegistry, METRICS};
