//! # Offer Engine
//!
//! The public face of the library. An `OfferEngine` is created idle from an
//! `EngineConfig`; the first `subscribe` starts a session (poll source, stream
//! source, summary poller, catalog fetch) on the ambient tokio runtime, and
//! dropping the last `Subscription` tears the session down again.
//!
//! ```no_run
//! # use lib_common::configs::EngineConfig;
//! # use lib_common::engine::OfferEngine;
//! # async fn demo() -> Result<(), lib_common::engine::EngineError> {
//! let engine = OfferEngine::new(EngineConfig::default())?;
//! let sub = engine.subscribe(|snapshot| {
//!     println!("#{}: {} offers", snapshot.sequence, snapshot.offers.len());
//! })?;
//! // ...
//! sub.unsubscribe();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::configs::{ConfigError, EngineConfig};
use crate::core::snapshot_store::{SnapshotStore, SubscriberId};
use crate::core::source_arbiter::{ArbiterMode, StreamState};
use crate::ingestors::feed_client::{Catalog, FeedClient};
use crate::ingestors::SourceError;
use crate::markets::gpu::model::{EnrichedOffer, FilterParams, MarketSummary, Snapshot};
use crate::markets::gpu::query::{self, OfferQuery, OfferStats};
use runtime::{Command, Session, Shared};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("No tokio runtime available to start the engine")]
    NoRuntime,
}

/// Point-in-time view of the engine for health checks and dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub running: bool,
    pub mode: ArbiterMode,
    pub stream_state: StreamState,
    pub last_error: Option<String>,
    /// True until the first snapshot of the session is published.
    pub loading: bool,
    pub sequence: u64,
    /// Records dropped by validation since start.
    pub rejected_records: u64,
    /// Records collapsed by batch de-duplication since start.
    pub duplicate_records: u64,
    /// Poll results discarded because the poll window had closed.
    pub stale_poll_results: u64,
    pub subscribers: usize,
}

enum Lifecycle {
    Idle,
    Running(Session),
}

struct EngineInner {
    config: Arc<EngineConfig>,
    client: FeedClient,
    store: Arc<SnapshotStore>,
    status: Arc<RwLock<EngineStatus>>,
    filters: watch::Sender<FilterParams>,
    summary: watch::Sender<Option<MarketSummary>>,
    catalog: Arc<RwLock<Option<Catalog>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// # Offer Engine
///
/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct OfferEngine {
    inner: Arc<EngineInner>,
}

impl OfferEngine {
    /// Validates `config` and builds an idle engine. No task is spawned and
    /// no connection is opened until the first `subscribe`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = FeedClient::new(&config)?;
        let (filters, _) = watch::channel(config.default_filters.clone());
        let (summary, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                client,
                store: Arc::new(SnapshotStore::new()),
                status: Arc::new(RwLock::new(EngineStatus { loading: true, ..EngineStatus::default() })),
                filters,
                summary,
                catalog: Arc::new(RwLock::new(None)),
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// # Subscribe
    ///
    /// Registers `on_snapshot` for every future snapshot and starts the
    /// session if the engine is idle. Must be called from within a tokio
    /// runtime. The current snapshot is not replayed; read it with
    /// `get_current`.
    pub fn subscribe<F>(&self, on_snapshot: F) -> Result<Subscription, EngineError>
    where
        F: Fn(Arc<Snapshot>) + Send + Sync + 'static,
    {
        Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.store.subscribe(on_snapshot);
        if let Lifecycle::Idle = *lifecycle {
            log::info!("First subscriber, starting engine for feed '{}'", inner.config.feed);
            inner.store.reset();
            *inner.status.write().unwrap_or_else(PoisonError::into_inner) = EngineStatus {
                running: true,
                loading: true,
                ..EngineStatus::default()
            };
            *lifecycle = Lifecycle::Running(runtime::spawn(self.shared()));
        }

        Ok(Subscription {
            engine: Arc::downgrade(inner),
            id,
            active: AtomicBool::new(true),
        })
    }

    /// The latest snapshot; the empty loading snapshot while idle or before
    /// the first publish.
    pub fn get_current(&self) -> Arc<Snapshot> {
        self.inner.store.get_current()
    }

    /// Replaces the filters. While running, the next poll request uses them
    /// immediately; in stream mode the last stream batch is re-filtered.
    pub fn set_filter_params(&self, params: FilterParams) {
        log::debug!("Filter params updated: {:?}", params);
        self.inner.filters.send_replace(params);
        self.send(Command::FiltersChanged).ok();
    }

    pub fn filter_params(&self) -> FilterParams {
        self.inner.filters.borrow().clone()
    }

    /// Requests an immediate refresh outside the regular interval.
    pub fn force_refresh(&self) -> Result<(), EngineError> {
        self.send(Command::ForceRefresh)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner),
            Lifecycle::Running(_)
        )
    }

    pub fn status(&self) -> EngineStatus {
        let mut status = self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        status.subscribers = self.inner.store.subscriber_count();
        status
    }

    /// Last market summary fetched; `None` until the first summary poll succeeds.
    pub fn summary(&self) -> Option<MarketSummary> {
        self.inner.summary.borrow().clone()
    }

    /// Region and model lists; the built-in catalog until the upstream lists
    /// have been fetched.
    pub fn catalog(&self) -> Catalog {
        self.inner
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(Catalog::fallback)
    }

    /// Filtered and sorted rows of the current snapshot.
    pub fn query(&self, q: &OfferQuery) -> Vec<EnrichedOffer> {
        let snapshot = self.get_current();
        query::run(&snapshot, q).into_iter().cloned().collect()
    }

    /// Aggregates over the rows `q` selects from the current snapshot.
    pub fn stats(&self, q: &OfferQuery) -> OfferStats {
        let snapshot = self.get_current();
        query::stats(query::run(&snapshot, q))
    }

    /// Stops the session regardless of subscribers and waits for the runtime
    /// task to finish. Idempotent. Existing subscriptions stay registered; a
    /// later `subscribe` starts a new session.
    pub async fn shutdown(&self) {
        let session = self.inner.stop();
        if let Some(session) = session {
            if let Err(e) = session.task.await {
                log::error!("Engine runtime task ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, cmd: Command) -> Result<(), EngineError> {
        let lifecycle = self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match &*lifecycle {
            Lifecycle::Running(session) => session.commands.send(cmd).map_err(|_| EngineError::Stopped),
            Lifecycle::Idle => Err(EngineError::Stopped),
        }
    }

    fn shared(&self) -> Shared {
        let inner = &self.inner;
        Shared {
            config: Arc::clone(&inner.config),
            client: inner.client.clone(),
            store: Arc::clone(&inner.store),
            status: Arc::clone(&inner.status),
            filters: inner.filters.subscribe(),
            summary: inner.summary.clone(),
            catalog: Arc::clone(&inner.catalog),
        }
    }
}

impl EngineInner {
    /// Cancels the running session, if any, and returns the store to the
    /// loading state.
    fn stop(&self) -> Option<Session> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        self.stop_locked(&mut lifecycle)
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Option<Session> {
        let Lifecycle::Running(session) = std::mem::replace(lifecycle, Lifecycle::Idle) else {
            return None;
        };
        session.cancel.cancel();
        self.store.reset();
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = EngineStatus {
            loading: true,
            ..EngineStatus::default()
        };
        log::info!("Engine stopped");
        Some(session)
    }

    /// Unsubscribes `id`; the last one out tears the session down. Runs under
    /// the lifecycle lock so a concurrent `subscribe` sees a consistent state.
    fn release(&self, id: SubscriberId) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.store.unsubscribe(id) == Some(0) {
            log::info!("Last subscriber gone, tearing down");
            self.stop_locked(&mut lifecycle);
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Running(session) = lifecycle {
            session.cancel.cancel();
        }
    }
}

/// # Subscription
///
/// Keeps the engine running while held. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    engine: Weak<EngineInner>,
    id: SubscriberId,
    active: AtomicBool,
}

impl Subscription {
    /// Removes this subscriber. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.engine.upgrade() {
            inner.release(self.id);
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
