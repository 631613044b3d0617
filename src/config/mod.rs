//! Daemon configuration
//!
//! Serde schema plus a file-backed store with a lock-free read cache.

pub mod schema;
pub mod store;

pub use schema::{AppConfig, ControlConfig, SourceConfig, UpstreamConfig};
pub use store::{ConfigChange, ConfigStore};
