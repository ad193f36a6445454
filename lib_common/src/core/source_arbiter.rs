//! # Source Arbiter
//!
//! Decides which ingestor is authoritative for the snapshot store. The
//! arbiter is a plain state machine: it performs no I/O and owns no tasks. The
//! engine runtime feeds it stream transitions and asks it whether a batch may
//! be published.
//!
//! Every mode change bumps an epoch counter. Poll requests carry the epoch
//! that was current when they were issued, so a response that lands after the
//! arbiter switched to streaming (or after a later switch back) is recognised
//! as belonging to a closed poll window and is dropped.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::markets::gpu::model::SourceKind;

/// Which source currently feeds the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArbiterMode {
    #[default]
    /// REST polling is authoritative. Initial state.
    UsingPoll,
    /// The push stream is authoritative; polling is suspended.
    UsingStream,
}

impl fmt::Display for ArbiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArbiterMode::UsingPoll => "usingPoll",
            ArbiterMode::UsingStream => "usingStream",
        })
    }
}

/// Connection state of the current stream instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What the poll loop should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    /// Poll on the interval, tagging each request with `epoch`.
    Active { epoch: u64 },
    /// Keep the interval but issue no requests.
    Suspended,
}

/// Side effect the runtime has to carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Stream became authoritative: suspend polling.
    SuspendPoll,
    /// Stream lost: resume polling with an immediate first tick.
    ResumePoll { epoch: u64 },
}

/// # Source Arbiter
///
/// `usingPoll → usingStream` on stream `connected`, `usingStream → usingPoll`
/// on stream `disconnected`. Also owns the reconnect backoff for new stream
/// instances.
#[derive(Debug, Clone)]
pub struct SourceArbiter {
    mode: ArbiterMode,
    stream: StreamState,
    epoch: u64,
    reconnect_attempts: u32,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

impl SourceArbiter {
    pub fn new(reconnect_base: Duration, reconnect_max: Duration) -> Self {
        Self {
            mode: ArbiterMode::UsingPoll,
            stream: StreamState::Disconnected,
            epoch: 0,
            reconnect_attempts: 0,
            reconnect_base,
            reconnect_max: reconnect_max.max(reconnect_base),
        }
    }

    pub fn mode(&self) -> ArbiterMode {
        self.mode
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current instruction for the poll loop.
    pub fn poll_control(&self) -> PollControl {
        match self.mode {
            ArbiterMode::UsingPoll => PollControl::Active { epoch: self.epoch },
            ArbiterMode::UsingStream => PollControl::Suspended,
        }
    }

    /// A new stream instance started connecting. Does not change the mode.
    pub fn on_stream_connecting(&mut self) {
        self.stream = StreamState::Connecting;
    }

    /// The stream instance reached `connected`.
    pub fn on_stream_connected(&mut self) -> Option<ModeChange> {
        self.stream = StreamState::Connected;
        self.reconnect_attempts = 0;
        if self.mode == ArbiterMode::UsingStream {
            return None;
        }
        self.mode = ArbiterMode::UsingStream;
        self.epoch += 1;
        log::info!("Arbiter: usingPoll -> usingStream (epoch {})", self.epoch);
        Some(ModeChange::SuspendPoll)
    }

    /// The stream instance closed, failed or never connected.
    pub fn on_stream_disconnected(&mut self) -> Option<ModeChange> {
        self.stream = StreamState::Disconnected;
        if self.mode == ArbiterMode::UsingPoll {
            return None;
        }
        self.mode = ArbiterMode::UsingPoll;
        self.epoch += 1;
        log::info!("Arbiter: usingStream -> usingPoll (epoch {})", self.epoch);
        Some(ModeChange::ResumePoll { epoch: self.epoch })
    }

    /// Whether a batch from `origin` may be published now. `epoch` is only
    /// meaningful for poll batches: the epoch the request was issued under.
    pub fn admit(&self, origin: SourceKind, epoch: u64) -> bool {
        match origin {
            SourceKind::Stream => {
                self.mode == ArbiterMode::UsingStream && self.stream == StreamState::Connected
            }
            SourceKind::Poll => self.mode == ArbiterMode::UsingPoll && epoch == self.epoch,
        }
    }

    /// Delay before the next stream instance is started. Doubles on each call
    /// from `reconnect_base` up to `reconnect_max`; reset by a successful
    /// connect.
    pub fn next_reconnect_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.reconnect_attempts.min(31)).unwrap_or(u32::MAX);
        let delay = self
            .reconnect_base
            .checked_mul(factor)
            .map_or(self.reconnect_max, |d| d.min(self.reconnect_max));
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> SourceArbiter {
        SourceArbiter::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn starts_polling() {
        let a = arbiter();
        assert_eq!(a.mode(), ArbiterMode::UsingPoll);
        assert_eq!(a.poll_control(), PollControl::Active { epoch: 0 });
        assert!(a.admit(SourceKind::Poll, 0));
        assert!(!a.admit(SourceKind::Stream, 0));
    }

    #[test]
    fn connect_suspends_and_disconnect_resumes() {
        let mut a = arbiter();
        a.on_stream_connecting();
        assert_eq!(a.mode(), ArbiterMode::UsingPoll);

        assert_eq!(a.on_stream_connected(), Some(ModeChange::SuspendPoll));
        assert_eq!(a.poll_control(), PollControl::Suspended);
        assert!(a.admit(SourceKind::Stream, 0));

        assert_eq!(a.on_stream_disconnected(), Some(ModeChange::ResumePoll { epoch: 2 }));
        assert_eq!(a.poll_control(), PollControl::Active { epoch: 2 });
        assert!(!a.admit(SourceKind::Stream, 0));
    }

    #[test]
    fn in_flight_poll_is_rejected_after_switch() {
        let mut a = arbiter();
        let issued_under = a.epoch();
        a.on_stream_connected();
        assert!(!a.admit(SourceKind::Poll, issued_under));

        // Still rejected after falling back: that window is closed.
        a.on_stream_disconnected();
        assert!(!a.admit(SourceKind::Poll, issued_under));
        assert!(a.admit(SourceKind::Poll, a.epoch()));
    }

    #[test]
    fn repeated_transitions_are_no_ops() {
        let mut a = arbiter();
        assert_eq!(a.on_stream_disconnected(), None);
        assert_eq!(a.epoch(), 0);
        a.on_stream_connected();
        assert_eq!(a.on_stream_connected(), None);
        assert_eq!(a.epoch(), 1);
    }

    #[test]
    fn reconnect_backoff_doubles_caps_and_resets() {
        let mut a = arbiter();
        let delays: Vec<u64> = (0..8).map(|_| a.next_reconnect_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        a.on_stream_connected();
        assert_eq!(a.next_reconnect_delay(), Duration::from_secs(1));

        for _ in 0..100 {
            a.next_reconnect_delay();
        }
        assert_eq!(a.next_reconnect_delay(), Duration::from_secs(60));
    }
}
