//! # Core Engine Module
//!
//! The stateful building blocks of the offer engine.
//!
//! ## Core Components:
//!
//! - **`snapshot_store`**: holds the current `Snapshot`, replaces it
//!   atomically and fans each replacement out to subscribers with zero-copy
//!   `Arc` clones.
//!
//! - **`source_arbiter`**: the explicit state machine deciding whether the
//!   stream or the poller is authoritative, plus the stream reconnect backoff.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Atomic snapshot holder and subscriber fan-out.
pub mod snapshot_store;
/// Stream / poll arbitration state machine.
pub mod source_arbiter;

pub use snapshot_store::{SnapshotCallback, SnapshotStore, SubscriberId};
pub use source_arbiter::{ArbiterMode, ModeChange, PollControl, SourceArbiter, StreamState};
