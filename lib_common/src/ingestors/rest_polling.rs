//! # REST Polling Ingestors
//!
//! Self-scheduling pollers for the REST side of a feed.
//!
//! ## Key Design Principles:
//! - **Controlled, not owned**: `PollSource` never decides on its own whether
//!   it should be polling. It follows a `watch<PollControl>` written by the
//!   engine runtime on behalf of the arbiter. While `Suspended` the loop keeps
//!   running but issues no request; on the switch back to `Active` the first
//!   tick fires immediately.
//! - **Bounded retries**: each round-trip gets `attempts` tries spaced by a
//!   fixed delay. After the last failure the outcome is reported as an error
//!   and the loop simply waits for the next tick.
//! - **Epoch tagging**: every outcome carries the arbiter epoch it was issued
//!   under, so the runtime can drop results that land after a mode switch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::feed_client::{FeedClient, PollBatch};
use super::SourceError;
use crate::core::source_arbiter::PollControl;
use crate::markets::gpu::model::{FilterParams, MarketSummary};

/// Result of one poll round-trip, retries included.
#[derive(Debug)]
pub struct PollOutcome {
    /// Arbiter epoch the request was issued under.
    pub epoch: u64,
    pub result: Result<PollBatch, SourceError>,
}

/// # Poll Source
///
/// Fixed-interval poller of `GET /api/{feed}/prices`.
pub struct PollSource {
    client: FeedClient,
    interval: Duration,
    attempts: u32,
    spacing: Duration,
    filters: watch::Receiver<FilterParams>,
    control: watch::Receiver<PollControl>,
    refresh: Arc<Notify>,
}

impl PollSource {
    pub fn new(
        client: FeedClient,
        interval: Duration,
        attempts: u32,
        spacing: Duration,
        filters: watch::Receiver<FilterParams>,
        control: watch::Receiver<PollControl>,
        refresh: Arc<Notify>,
    ) -> Self {
        Self {
            client,
            interval,
            attempts: attempts.max(1),
            spacing,
            filters,
            control,
            refresh,
        }
    }

    /// # Main Execution Loop
    ///
    /// Runs until `cancel` fires or the outcome receiver is dropped.
    ///
    /// ## Workflow:
    /// 1.  Wait until the control channel says `Active`.
    /// 2.  Wait for the next tick, an explicit refresh, or a control change.
    /// 3.  Issue the request with the current filters, retrying per policy.
    /// 4.  Send the tagged outcome, success or failure, and loop.
    pub async fn run(mut self, outcomes: mpsc::UnboundedSender<PollOutcome>, cancel: CancellationToken) {
        log::info!("Poll source started ({:?} interval)", self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_epoch: Option<u64> = None;

        loop {
            let Some(epoch) = self.wait_active(&cancel).await else {
                break;
            };
            if last_epoch.is_some_and(|prev| prev != epoch) {
                // Resumed after a suspension: poll now, not one interval later.
                ticker.reset_immediately();
            }
            last_epoch = Some(epoch);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => {
                    log::debug!("Poll source: immediate refresh requested");
                }
                changed = self.control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let filters = self.filters.borrow().clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.fetch_with_retry(&filters, epoch) => r,
            };
            let Some(result) = result else {
                log::debug!("Poll source: epoch {} closed during retries, outcome discarded", epoch);
                continue;
            };

            if outcomes.send(PollOutcome { epoch, result }).is_err() {
                break;
            }
            // The next regular poll is one full interval after this one finished.
            ticker.reset();
        }
        log::info!("Poll source stopped");
    }

    /// Blocks while suspended. `None` when cancelled or the controller is gone.
    async fn wait_active(&mut self, cancel: &CancellationToken) -> Option<u64> {
        loop {
            if let PollControl::Active { epoch } = *self.control.borrow_and_update() {
                return Some(epoch);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Up to `attempts` tries with `spacing` between them. Returns `None` when
    /// the poll window closed (suspended or re-epoched) before a retry.
    async fn fetch_with_retry(
        &self,
        filters: &FilterParams,
        epoch: u64,
    ) -> Option<Result<PollBatch, SourceError>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.fetch_prices(filters).await {
                Ok(batch) => {
                    if attempt > 1 {
                        log::info!("Poll succeeded on attempt {}/{}", attempt, self.attempts);
                    }
                    return Some(Ok(batch));
                }
                Err(e) if attempt >= self.attempts => {
                    log::error!("Poll failed on attempt {}/{}: {}. Giving up until next tick.", attempt, self.attempts, e);
                    return Some(Err(SourceError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    }));
                }
                Err(e) => {
                    log::error!("Poll failed on attempt {}/{}: {}", attempt, self.attempts, e);
                }
            }

            sleep(self.spacing).await;
            if *self.control.borrow() != (PollControl::Active { epoch }) {
                return None;
            }
        }
    }
}

/// # Summary Poller
///
/// Low-frequency poller of `GET /api/{feed}/summary`. Not arbitrated: the
/// summary is a separate read model and never touches the snapshot store.
pub struct SummaryPoller {
    client: FeedClient,
    interval: Duration,
}

impl SummaryPoller {
    pub fn new(client: FeedClient, interval: Duration) -> Self {
        Self { client, interval }
    }

    /// Publishes each successful fetch into `sink`; failures keep the previous
    /// value and are only logged.
    pub async fn run(self, sink: watch::Sender<Option<MarketSummary>>, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.client.fetch_summary() => r,
            };
            match fetched {
                Ok(summary) => {
                    log::debug!(
                        "Summary: {} offers, {} models, {} regions",
                        summary.total_offers,
                        summary.unique_models,
                        summary.unique_regions
                    );
                    sink.send_replace(Some(summary));
                }
                Err(e) => log::warn!("Summary fetch failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::EngineConfig;

    fn client() -> FeedClient {
        // Nothing listens on the discard port; every request fails.
        let config = EngineConfig { base_url: "http://127.0.0.1:9".into(), ..EngineConfig::default() };
        FeedClient::new(&config).unwrap()
    }

    fn source(control: PollControl, every: Duration) -> (PollSource, watch::Sender<PollControl>) {
        let (_filters_tx, filters) = watch::channel(FilterParams::default());
        let (control_tx, control_rx) = watch::channel(control);
        let source = PollSource::new(
            client(),
            every,
            2,
            Duration::from_secs(1),
            filters,
            control_rx,
            Arc::new(Notify::new()),
        );
        (source, control_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_source_issues_nothing() {
        let (source, _control) = source(PollControl::Suspended, Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_once_per_round_with_epoch() {
        let (source, _control) = source(PollControl::Active { epoch: 4 }, Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(tx, cancel.clone()));

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.epoch, 4);
        assert!(matches!(outcome.result, Err(SourceError::Exhausted { attempts: 2, .. })));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resume_polls_immediately_not_one_interval_later() {
        let every = Duration::from_secs(300);
        let (source, control) = source(PollControl::Active { epoch: 0 }, every);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(tx, cancel.clone()));

        assert_eq!(rx.recv().await.unwrap().epoch, 0);

        control.send_replace(PollControl::Suspended);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        control.send_replace(PollControl::Active { epoch: 2 });
        let resumed = tokio::time::Instant::now();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.epoch, 2);
        // Two failed attempts and their spacing, far short of the interval.
        assert!(resumed.elapsed() < every / 5, "resumed after {:?}", resumed.elapsed());

        cancel.cancel();
        handle.await.unwrap();
    }
}
