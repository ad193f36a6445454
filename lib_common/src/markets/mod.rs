//! # Market Data Module
//!
//! Groups the provider-specific data models and pure transforms used by the
//! engine.
//!
//! ## Contained Modules:
//!
//! - **`gpu`**: GPU rental offers: model, reference tables, validation,
//!   enrichment and queries.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// GPU rental offer model and its pure processing pipeline.
pub mod gpu;
