//! # Data Retrieval Module
//!
//! Generic HTTP retrieval shared by every REST consumer in the crate, so
//! request building, query strings, authentication and transient retries live
//! in one place.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: `ApiClient`, built on `reqwest` and `reqwest-middleware`,
//!   with optional exponential-backoff retries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse, ClientOptions};
