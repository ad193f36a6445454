//! # lib_common
//!
//! Live GPU offer sync and enrichment engine. Modules are gated by Cargo
//! features named after their folders; `full` enables everything.

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "engine")]
pub mod engine;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "markets")]
pub mod markets;

#[cfg(feature = "retrieve")]
pub mod retrieve;
