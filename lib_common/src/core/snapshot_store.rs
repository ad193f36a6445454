//! # Snapshot Store
//!
//! Holds the single current `Snapshot` and fans every replacement out to the
//! registered subscribers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Atomic replacement**: the current snapshot lives behind an
//!     `RwLock<Arc<Snapshot>>`. A publish builds the complete new snapshot
//!     first and swaps the pointer under the write lock, so a reader sees
//!     either the old snapshot or the new one, never a mix.
//!
//! 2.  **Zero-copy fan-out**: subscribers receive an `Arc` clone of the same
//!     snapshot. Callbacks run after every lock has been released, so a slow
//!     or re-entrant callback cannot block readers.
//!
//! 3.  **No going back**: a publish from the same origin with an older
//!     `last_updated` than the current snapshot is discarded.
//!
//! 4.  **Errors travel with the data**: a transport failure re-issues the
//!     current offers with `error` set, so subscribers learn about it through
//!     the same callback. The next successful publish clears it.
//!
//! Writers that can be retired (an engine session being torn down) use the
//! `_if` variants. Their `admit` check runs under the write lock, so it is
//! ordered against `reset`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::markets::gpu::model::{EnrichedOffer, Snapshot, SnapshotMetadata, SourceKind};

/// Callback invoked with every newly published snapshot.
pub type SnapshotCallback = dyn Fn(Arc<Snapshot>) + Send + Sync;

/// Identifies one registration with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    callback: Arc<SnapshotCallback>,
}

/// # Snapshot Store
///
/// The only shared mutable state of the engine. Written by the engine runtime
/// on behalf of the authoritative source, read by any number of consumers.
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    /// Creates a store holding the empty loading snapshot.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The latest published snapshot. Never blocks on a publish for longer
    /// than a pointer swap.
    pub fn get_current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Error reported by the last failed transport operation, cleared by the
    /// next successful publish.
    pub fn last_error(&self) -> Option<String> {
        self.get_current().error.clone()
    }

    /// Records a transport error next to the current offers and notifies
    /// subscribers. Returns `None` when the same error is already set.
    pub fn set_error(&self, message: impl Into<String>) -> Option<Arc<Snapshot>> {
        self.set_error_if(|| true, message)
    }

    /// `set_error`, applied only if `admit` holds under the write lock.
    pub fn set_error_if(
        &self,
        admit: impl FnOnce() -> bool,
        message: impl Into<String>,
    ) -> Option<Arc<Snapshot>> {
        let message = message.into();
        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if !admit() || current.error.as_deref() == Some(message.as_str()) {
                return None;
            }
            // Same data and sequence, only the error changes.
            let next = Arc::new(Snapshot {
                error: Some(message),
                ..Snapshot::clone(&current)
            });
            *current = Arc::clone(&next);
            next
        };
        self.notify(&snapshot);
        Some(snapshot)
    }

    /// # Publish
    ///
    /// Replaces the current snapshot with one built from `offers` and notifies
    /// every subscriber.
    ///
    /// Returns the new snapshot, or `None` when the batch was older than the
    /// current snapshot from the same origin and was discarded.
    pub fn publish(
        &self,
        origin: SourceKind,
        offers: Vec<EnrichedOffer>,
        last_updated: Option<DateTime<Utc>>,
    ) -> Option<Arc<Snapshot>> {
        self.publish_if(|| true, origin, offers, last_updated)
    }

    /// `publish`, applied only if `admit` holds under the write lock.
    pub fn publish_if(
        &self,
        admit: impl FnOnce() -> bool,
        origin: SourceKind,
        offers: Vec<EnrichedOffer>,
        last_updated: Option<DateTime<Utc>>,
    ) -> Option<Arc<Snapshot>> {
        let snapshot = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if !admit() {
                return None;
            }

            if current.origin == Some(origin) {
                if let (Some(prev), Some(next)) = (current.metadata.last_updated, last_updated) {
                    if next < prev {
                        log::debug!(
                            "Discarding {:?} batch observed at {} (current snapshot is from {})",
                            origin,
                            next,
                            prev
                        );
                        return None;
                    }
                }
            }

            let metadata = SnapshotMetadata::derive(&offers, last_updated);
            let next = Arc::new(Snapshot {
                sequence: current.sequence + 1,
                origin: Some(origin),
                offers,
                metadata,
                error: None,
            });
            *current = Arc::clone(&next);
            next
        };

        self.notify(&snapshot);
        Some(snapshot)
    }

    /// Registers `callback` for every future publish.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(Arc<Snapshot>) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber { id, callback: Arc::new(callback) });
        log::debug!("Subscriber {:?} registered ({} total)", id, subs.len());
        id
    }

    /// Removes a registration. Returns the number of remaining subscribers, or
    /// `None` if `id` was not registered (already removed).
    pub fn unsubscribe(&self, id: SubscriberId) -> Option<usize> {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return None;
        }
        log::debug!("Subscriber {:?} removed ({} remaining)", id, subs.len());
        Some(subs.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops the current snapshot and error, back to the loading state.
    pub fn reset(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Snapshot::empty());
    }

    fn notify(&self, snapshot: &Arc<Snapshot>) {
        // Clone the callbacks out so none of them runs under the lock.
        let callbacks: Vec<Arc<SnapshotCallback>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for cb in callbacks {
            cb(Arc::clone(snapshot));
        }
    }
}
