//! Infrastructure - configuration, metrics, and persisted state
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `store` - Opaque key-value cache for last position, zones and voice settings

pub mod config;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
pub use store::{FileStore, KvStore, MemoryStore};
