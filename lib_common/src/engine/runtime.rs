//! # Engine Runtime
//!
//! The single writer of the snapshot store. One task owns the
//! `SourceArbiter` and consumes, in one `select!` loop, the commands from the
//! facade, the outcomes of the poll source and the events of the current
//! stream instance. Because every publish goes through this loop, batches
//! from the two sources can never interleave.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::EngineStatus;
use crate::configs::EngineConfig;
use crate::core::snapshot_store::SnapshotStore;
use crate::core::source_arbiter::{ModeChange, PollControl, SourceArbiter};
use crate::ingestors::feed_client::{Catalog, FeedClient};
use crate::ingestors::rest_polling::{PollOutcome, PollSource, SummaryPoller};
use crate::ingestors::stream_wss::{StreamBatch, StreamEvent, StreamSource};
use crate::markets::gpu::enricher::enrich_batch;
use crate::markets::gpu::model::{EnrichedOffer, FilterParams, MarketSummary, RawOffer, SourceKind};
use crate::markets::gpu::validator::validate_batch;

/// Requests from the facade to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    FiltersChanged,
    ForceRefresh,
}

/// State shared between the facade and one running session.
#[derive(Clone)]
pub(crate) struct Shared {
    pub config: Arc<EngineConfig>,
    pub client: FeedClient,
    pub store: Arc<SnapshotStore>,
    pub status: Arc<RwLock<EngineStatus>>,
    pub filters: watch::Receiver<FilterParams>,
    pub summary: watch::Sender<Option<MarketSummary>>,
    pub catalog: Arc<RwLock<Option<Catalog>>>,
}

/// Handle on a running session, owned by the facade.
pub(crate) struct Session {
    pub cancel: CancellationToken,
    pub commands: mpsc::UnboundedSender<Command>,
    pub task: JoinHandle<()>,
}

/// Last accepted stream batch, kept validated so filter changes can be
/// re-applied without waiting for the next frame.
struct LastStreamBatch {
    offers: Vec<RawOffer>,
    observed_at: Option<chrono::DateTime<Utc>>,
    claimed_source: Option<String>,
}

pub(crate) struct Coordinator {
    shared: Shared,
    arbiter: SourceArbiter,
    poll_control: watch::Sender<PollControl>,
    refresh: Arc<Notify>,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_instance: u64,
    stream_cancel: Option<CancellationToken>,
    reconnect_at: Option<Instant>,
    last_stream: Option<LastStreamBatch>,
    cancel: CancellationToken,
}

/// Starts a session: the coordinator task plus the poll source, the summary
/// poller and the one-shot catalog fetch, all under one cancellation tree.
pub(crate) fn spawn(shared: Shared) -> Session {
    let cancel = CancellationToken::new();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (poll_tx, poll_rx) = mpsc::unbounded_channel();
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();

    let config = Arc::clone(&shared.config);
    let arbiter = SourceArbiter::new(config.reconnect_base_delay, config.reconnect_max_delay);
    let (poll_control, control_rx) = watch::channel(arbiter.poll_control());
    let refresh = Arc::new(Notify::new());

    let poll_source = PollSource::new(
        shared.client.clone(),
        config.poll_interval,
        config.retry_attempts,
        config.retry_spacing,
        shared.filters.clone(),
        control_rx,
        Arc::clone(&refresh),
    );
    tokio::spawn(poll_source.run(poll_tx, cancel.child_token()));

    let summary = SummaryPoller::new(shared.client.clone(), config.summary_interval);
    tokio::spawn(summary.run(shared.summary.clone(), cancel.child_token()));

    {
        let client = shared.client.clone();
        let catalog = Arc::clone(&shared.catalog);
        let token = cancel.child_token();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                c = client.fetch_catalog() => c,
            };
            *catalog.write().unwrap_or_else(PoisonError::into_inner) = Some(fetched);
        });
    }

    let mut coordinator = Coordinator {
        shared,
        arbiter,
        poll_control,
        refresh,
        stream_tx,
        stream_instance: 0,
        stream_cancel: None,
        reconnect_at: None,
        last_stream: None,
        cancel: cancel.clone(),
    };
    coordinator.sync_status();
    if coordinator.shared.config.stream_enabled {
        coordinator.start_stream();
    }

    let task = tokio::spawn(coordinator.run(cmd_rx, poll_rx, stream_rx));
    Session { cancel, commands: cmd_tx, task }
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut polls: mpsc::UnboundedReceiver<PollOutcome>,
        mut streams: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        log::info!("Engine runtime started for feed '{}'", self.shared.config.feed);
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(cmd) = commands.recv() => self.on_command(cmd),
                Some(event) = streams.recv() => self.on_stream_event(event),
                Some(outcome) = polls.recv() => self.on_poll(outcome),
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.start_stream();
                }
            }
        }
        if let Some(token) = self.stream_cancel.take() {
            token.cancel();
        }
        log::info!("Engine runtime stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match (cmd, self.arbiter.poll_control()) {
            (_, PollControl::Active { .. }) => self.refresh.notify_one(),
            // Streaming: nothing to poll, re-derive the snapshot from the last frame.
            (Command::FiltersChanged, PollControl::Suspended)
            | (Command::ForceRefresh, PollControl::Suspended) => self.republish_stream(),
        }
    }

    fn on_poll(&mut self, outcome: PollOutcome) {
        let PollOutcome { epoch, result } = outcome;
        if !self.arbiter.admit(SourceKind::Poll, epoch) {
            log::debug!(
                "Dropping poll outcome from epoch {} (arbiter at epoch {}, {})",
                epoch,
                self.arbiter.epoch(),
                self.arbiter.mode()
            );
            self.with_status(|s| s.stale_poll_results += 1);
            return;
        }

        match result {
            Ok(batch) => {
                let outcome = validate_batch(&batch.offers);
                self.count_drops(outcome.rejected, outcome.duplicates);
                let filters = self.shared.filters.borrow().clone();
                let now = Utc::now();
                let offers = filters.apply(enrich_batch(&outcome.offers, now));
                self.publish(
                    SourceKind::Poll,
                    offers,
                    batch.last_updated.or(Some(now)),
                    batch.data_source.as_deref(),
                );
            }
            Err(e) => {
                // Previous snapshot stays; the error is surfaced next to it.
                self.set_error(e.to_string());
            }
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { instance } if instance == self.stream_instance => {
                if let Some(ModeChange::SuspendPoll) = self.arbiter.on_stream_connected() {
                    self.poll_control.send_replace(PollControl::Suspended);
                }
                self.sync_status();
            }
            StreamEvent::Batch { instance, batch } if instance == self.stream_instance => {
                if self.arbiter.admit(SourceKind::Stream, 0) {
                    self.on_stream_batch(batch);
                }
            }
            StreamEvent::Disconnected { instance, reason } if instance == self.stream_instance => {
                self.stream_cancel = None;
                self.last_stream = None;
                if let Some(ModeChange::ResumePoll { epoch }) = self.arbiter.on_stream_disconnected() {
                    self.poll_control.send_replace(PollControl::Active { epoch });
                }
                if let Some(reason) = reason {
                    self.set_error(format!("stream disconnected: {}", reason));
                }
                let delay = self.arbiter.next_reconnect_delay();
                log::info!("Next stream attempt in {:?}", delay);
                self.reconnect_at = Some(Instant::now() + delay);
                self.sync_status();
            }
            other => log::debug!("Ignoring event from retired stream instance: {:?}", other),
        }
    }

    fn on_stream_batch(&mut self, batch: StreamBatch) {
        let outcome = validate_batch(&batch.offers);
        self.count_drops(outcome.rejected, outcome.duplicates);
        self.last_stream = Some(LastStreamBatch {
            offers: outcome.offers,
            observed_at: batch.observed_at,
            claimed_source: batch.data_source,
        });
        self.republish_stream();
    }

    /// Enriches and filters the last stream batch and publishes it.
    fn republish_stream(&mut self) {
        let Some(last) = &self.last_stream else {
            return;
        };
        let now = Utc::now();
        let filters = self.shared.filters.borrow().clone();
        let offers = filters.apply(enrich_batch(&last.offers, now));
        let observed_at = last.observed_at.or(Some(now));
        let claimed = last.claimed_source.clone();
        self.publish(SourceKind::Stream, offers, observed_at, claimed.as_deref());
    }

    /// Writes to the store only while this session is live. The cancel check
    /// runs under the store lock, so a teardown's `reset` always wins.
    fn publish(
        &mut self,
        origin: SourceKind,
        offers: Vec<EnrichedOffer>,
        last_updated: Option<chrono::DateTime<Utc>>,
        claimed_source: Option<&str>,
    ) {
        let cancel = &self.cancel;
        let published = self
            .shared
            .store
            .publish_if(|| !cancel.is_cancelled(), origin, offers, last_updated);
        if let Some(snapshot) = published {
            log::debug!(
                "Published snapshot #{} from {:?}: {} offers",
                snapshot.sequence,
                origin,
                snapshot.metadata.total_count
            );
            let derived = snapshot.metadata.data_source.to_string();
            if let Some(claimed) = claimed_source.filter(|c| !c.eq_ignore_ascii_case(&derived)) {
                log::debug!(
                    "{:?} batch claims data source '{}', offers say '{}'",
                    origin,
                    claimed,
                    derived
                );
            }
        }
        self.sync_status();
    }

    fn set_error(&mut self, message: String) {
        let cancel = &self.cancel;
        if self.shared.store.set_error_if(|| !cancel.is_cancelled(), message).is_some() {
            self.sync_status();
        }
    }

    fn start_stream(&mut self) {
        self.stream_instance += 1;
        let source = match StreamSource::from_config(self.stream_instance, &self.shared.config) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Stream disabled, invalid stream URL: {}", e);
                return;
            }
        };
        self.arbiter.on_stream_connecting();
        let token = self.cancel.child_token();
        self.stream_cancel = Some(token.clone());
        tokio::spawn(source.run(self.stream_tx.clone(), token));
        self.sync_status();
    }

    fn count_drops(&self, rejected: usize, duplicates: usize) {
        if rejected > 0 || duplicates > 0 {
            self.with_status(|s| {
                s.rejected_records += rejected as u64;
                s.duplicate_records += duplicates as u64;
            });
        }
    }

    /// Applies `f` unless the session is cancelled. Checked under the status
    /// lock, which teardown takes after cancelling.
    fn with_status(&self, f: impl FnOnce(&mut EngineStatus)) {
        let mut status = self.shared.status.write().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return;
        }
        f(&mut status);
    }

    fn sync_status(&self) {
        let current = self.shared.store.get_current();
        let error = self.shared.store.last_error();
        let mode = self.arbiter.mode();
        let stream = self.arbiter.stream_state();
        self.with_status(|s| {
            s.running = true;
            s.mode = mode;
            s.stream_state = stream;
            s.sequence = current.sequence;
            s.loading = current.is_loading();
            s.last_error = error;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::feed_client::PollBatch;
    use crate::ingestors::SourceError;
    use crate::markets::gpu::model::DataSourceMode;
    use serde_json::json;
    use std::time::Duration;

    /// A coordinator wired to nothing: no tasks are spawned, events are
    /// injected by hand.
    fn coordinator() -> Coordinator {
        let config = Arc::new(EngineConfig::default());
        let (_filters_tx, filters) = watch::channel(FilterParams::default());
        let (summary, _) = watch::channel(None);
        let shared = Shared {
            client: FeedClient::new(&config).unwrap(),
            config,
            store: Arc::new(SnapshotStore::new()),
            status: Arc::new(RwLock::new(EngineStatus::default())),
            filters,
            summary,
            catalog: Arc::new(RwLock::new(None)),
        };
        let arbiter = SourceArbiter::new(Duration::from_secs(1), Duration::from_secs(60));
        let (poll_control, _) = watch::channel(arbiter.poll_control());
        let (stream_tx, _) = mpsc::unbounded_channel();
        Coordinator {
            shared,
            arbiter,
            poll_control,
            refresh: Arc::new(Notify::new()),
            stream_tx,
            stream_instance: 1,
            stream_cancel: None,
            reconnect_at: None,
            last_stream: None,
            cancel: CancellationToken::new(),
        }
    }

    fn record(model: &str, availability: u32) -> serde_json::Value {
        json!({
            "model": model,
            "usd_hr": 1.2,
            "region": "us-east-1",
            "availability": availability,
            "instance_type": "p4d.24xlarge",
            "provider": "aws_spot",
            "timestamp": Utc::now().to_rfc3339()
        })
    }

    fn poll_ok(epoch: u64, offers: Vec<serde_json::Value>) -> PollOutcome {
        PollOutcome {
            epoch,
            result: Ok(PollBatch {
                offers,
                last_updated: Some(Utc::now()),
                data_source: Some("live".to_string()),
            }),
        }
    }

    fn stream_batch(offers: Vec<serde_json::Value>) -> StreamEvent {
        StreamEvent::Batch {
            instance: 1,
            batch: StreamBatch { offers, observed_at: Some(Utc::now()), data_source: Some("live".into()) },
        }
    }

    #[tokio::test]
    async fn in_flight_poll_applies_before_connect_and_is_dropped_after() {
        let mut c = coordinator();
        let issued = c.arbiter.epoch();

        // Arrives before the stream connects: applied.
        c.on_poll(poll_ok(issued, vec![record("A100", 8)]));
        assert_eq!(c.shared.store.get_current().sequence, 1);

        // A second request issued under the same epoch lands after connect.
        c.on_stream_event(StreamEvent::Connected { instance: 1 });
        assert_eq!(*c.poll_control.borrow(), PollControl::Suspended);
        c.on_poll(poll_ok(issued, vec![record("T4", 1)]));
        let snap = c.shared.store.get_current();
        assert_eq!(snap.sequence, 1);
        assert_eq!(snap.offers[0].offer.model, "A100");
        assert_eq!(c.shared.status.read().unwrap().stale_poll_results, 1);

        // Stream data is now authoritative.
        c.on_stream_event(stream_batch(vec![record("H100", 4)]));
        assert_eq!(c.shared.store.get_current().origin, Some(SourceKind::Stream));
    }

    #[tokio::test]
    async fn disconnect_resumes_polling_and_schedules_reconnect() {
        let mut c = coordinator();
        c.on_stream_event(StreamEvent::Connected { instance: 1 });
        c.on_stream_event(StreamEvent::Disconnected { instance: 1, reason: Some("reset".into()) });

        let epoch = c.arbiter.epoch();
        assert_eq!(*c.poll_control.borrow(), PollControl::Active { epoch });
        assert!(c.reconnect_at.is_some());
        assert!(c.shared.store.last_error().unwrap().contains("reset"));

        // Stream batches are no longer admitted.
        c.on_stream_event(stream_batch(vec![record("H100", 4)]));
        assert!(c.shared.store.get_current().is_loading());

        c.on_poll(poll_ok(epoch, vec![record("A100", 8)]));
        assert_eq!(c.shared.store.get_current().origin, Some(SourceKind::Poll));
    }

    #[tokio::test]
    async fn events_from_retired_instances_are_ignored() {
        let mut c = coordinator();
        c.stream_instance = 2;
        c.on_stream_event(StreamEvent::Connected { instance: 1 });
        assert_eq!(c.arbiter.mode(), crate::core::ArbiterMode::UsingPoll);
    }

    #[tokio::test]
    async fn failed_poll_keeps_previous_snapshot() {
        let mut c = coordinator();
        c.on_poll(poll_ok(0, vec![record("A100", 8), json!({"model": "broken"})]));
        c.on_poll(PollOutcome {
            epoch: 0,
            result: Err(SourceError::Exhausted {
                attempts: 3,
                last: Box::new(SourceError::Status { status: 503, body: String::new() }),
            }),
        });

        let snap = c.shared.store.get_current();
        assert_eq!(snap.offers.len(), 1);
        assert!(snap.error.as_deref().unwrap().contains("3 attempts"));
        let status = c.shared.status.read().unwrap().clone();
        assert!(status.last_error.unwrap().contains("3 attempts"));
        assert_eq!(status.rejected_records, 1);
    }

    #[tokio::test]
    async fn subscribers_see_exhaustion_next_to_last_good_offers() {
        let mut c = coordinator();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.shared.store.subscribe(move |s| sink.lock().unwrap().push(s));

        c.on_poll(poll_ok(0, vec![record("A100", 8)]));
        c.on_poll(PollOutcome {
            epoch: 0,
            result: Err(SourceError::Exhausted {
                attempts: 3,
                last: Box::new(SourceError::Status { status: 503, body: String::new() }),
            }),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let last = &seen[1];
        assert_eq!(last.offers.len(), 1);
        assert_eq!(last.sequence, seen[0].sequence);
        assert!(last.error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn cancelled_session_writes_nothing() {
        let mut c = coordinator();
        c.on_poll(poll_ok(0, vec![record("A100", 8)]));
        c.cancel.cancel();
        // Teardown resets after cancelling.
        c.shared.store.reset();
        *c.shared.status.write().unwrap() = EngineStatus { loading: true, ..EngineStatus::default() };

        c.on_poll(poll_ok(0, vec![record("T4", 1)]));
        c.on_poll(PollOutcome {
            epoch: 0,
            result: Err(SourceError::Status { status: 500, body: String::new() }),
        });
        c.on_stream_event(StreamEvent::Connected { instance: 1 });

        let snap = c.shared.store.get_current();
        assert!(snap.is_loading());
        assert!(snap.error.is_none());
        let status = c.shared.status.read().unwrap().clone();
        assert!(!status.running);
        assert!(status.loading);
        assert_eq!(status.sequence, 0);
    }

    #[tokio::test]
    async fn empty_poll_is_data_source_none() {
        let mut c = coordinator();
        c.on_poll(poll_ok(0, vec![]));
        let snap = c.shared.store.get_current();
        assert_eq!(snap.metadata.data_source, DataSourceMode::None);
        assert!(snap.metadata.models.is_empty());
        assert!(!snap.is_loading());
    }

    #[tokio::test]
    async fn stream_batches_are_filtered_and_refiltered() {
        let (filters_tx, filters) = watch::channel(FilterParams::default());
        let mut c = coordinator();
        c.shared.filters = filters;
        c.on_stream_event(StreamEvent::Connected { instance: 1 });
        c.on_stream_event(stream_batch(vec![record("A100", 8), record("T4", 1)]));
        assert_eq!(c.shared.store.get_current().offers.len(), 2);

        filters_tx.send_replace(FilterParams { min_availability: Some(4), ..FilterParams::default() });
        c.on_command(Command::FiltersChanged);
        let snap = c.shared.store.get_current();
        assert_eq!(snap.offers.len(), 1);
        assert_eq!(snap.offers[0].offer.model, "A100");
    }
}
