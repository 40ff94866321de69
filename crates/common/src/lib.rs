//! Shared configuration, error types, IDs, and observability primitives for
//! Quarry crates.
//!
//! Architecture role:
//! - defines resource-runtime configuration passed across layers
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - hosts the prometheus metrics surface consumed by external collectors
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::{QueryOptions, RuntimeConfig, DEFAULT_BATCH_SIZE_ROWS};
pub use error::{QuarryError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
