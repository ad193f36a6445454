//! # Data Ingestors Module
//!
//! The network-facing side of the engine. Each submodule talks to one kind of
//! upstream endpoint and hands untyped offer records to the engine runtime;
//! validation and enrichment happen downstream of these clients.
//!
//! ## Contained Modules:
//! - **`feed_client`**: typed REST calls against `/api/{feed}/...` (prices,
//!   summary, regions, models) with the built-in catalog fallback.
//! - **`rest_polling`**: `PollSource`, the fixed-interval poller with bounded
//!   retries, and the low-frequency summary poller.
//! - **`stream_wss`**: `StreamSource`, one WebSocket connection per instance
//!   with an inactivity watchdog and no internal reconnect.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use thiserror::Error;

/// Typed REST client for the feed endpoints.
pub mod feed_client;
/// Fixed-interval REST poller and summary poller.
pub mod rest_polling;
/// Single-connection WebSocket stream client.
pub mod stream_wss;

pub use feed_client::{Catalog, FeedClient, PollBatch};
pub use rest_polling::{PollOutcome, PollSource, SummaryPoller};
pub use stream_wss::{StreamBatch, StreamEvent, StreamSource};

/// Transport-level failures of the ingestors. Malformed records are not
/// errors; see `markets::gpu::validator`.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] anyhow::Error),

    #[error("Upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not decode upstream payload: {0}")]
    Decode(String),

    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<SourceError> },
}
