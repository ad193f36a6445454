//! # Configuration Modules
//!
//! Configuration structs passed explicitly into the engine at construction.

/// Upstream endpoints, intervals, retry/reconnect policy and default filters.
pub mod engine_config;

pub use engine_config::{ConfigError, EngineConfig};
