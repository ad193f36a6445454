//! # Offer Stream Ingestor
//!
//! WebSocket client for the push side of a feed. One `StreamSource` value is
//! one connection attempt: `disconnected → connecting → connected →
//! disconnected`. It never reconnects by itself; when the connection ends the
//! instance reports `Disconnected` and finishes, and the engine runtime
//! decides when to start a fresh one.
//!
//! Each text frame is one update batch: `{type, offers, timestamp,
//! dataSource?}`. Frames with another `type` are ignored; frames that do not
//! parse are logged and dropped while the connection stays open.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::configs::{ConfigError, EngineConfig};
use crate::core::source_arbiter::StreamState;
use crate::markets::gpu::model::StreamFrame;

/// Untyped offers of one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub offers: Vec<Value>,
    /// Observation instant stated by the frame.
    pub observed_at: Option<DateTime<Utc>>,
    pub data_source: Option<String>,
}

/// Lifecycle and data events of one stream instance.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { instance: u64 },
    Batch { instance: u64, batch: StreamBatch },
    /// Terminal. `reason` is `None` for a clean close by the remote end.
    Disconnected { instance: u64, reason: Option<String> },
}

/// # Stream Source
pub struct StreamSource {
    instance: u64,
    url: Url,
    connect_timeout: Duration,
    inactivity_timeout: Duration,
    accepted_types: Vec<String>,
    state: StreamState,
}

impl StreamSource {
    /// A new, not yet connected instance.
    pub fn from_config(instance: u64, config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            instance,
            url: config.stream_url()?,
            connect_timeout: config.request_timeout,
            inactivity_timeout: config.stream_inactivity_timeout,
            accepted_types: config.stream_frame_types(),
            state: StreamState::Disconnected,
        })
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn transition(&mut self, next: StreamState) {
        log::debug!("Stream #{}: {:?} -> {:?}", self.instance, self.state, next);
        self.state = next;
    }

    /// Parses one text frame. `Ok(None)` for a well-formed frame of a type
    /// this feed does not consume.
    pub fn parse_frame(&self, text: &str) -> Result<Option<StreamBatch>, serde_json::Error> {
        let frame: StreamFrame = serde_json::from_str(text)?;
        if !self.accepted_types.iter().any(|t| *t == frame.kind) {
            return Ok(None);
        }
        Ok(Some(StreamBatch {
            offers: frame.offers,
            observed_at: frame.timestamp,
            data_source: frame.data_source,
        }))
    }

    /// Connects, forwards batches until the connection ends, then reports
    /// `Disconnected` and returns. Cancellation closes the socket without
    /// reporting anything.
    pub async fn run(mut self, events: mpsc::UnboundedSender<StreamEvent>, cancel: CancellationToken) {
        let instance = self.instance;
        self.transition(StreamState::Connecting);
        log::info!("Stream #{}: connecting to {}", instance, self.url);

        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            r = timeout(self.connect_timeout, connect_async(self.url.as_str())) => r,
        };
        let ws_stream = match connect {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                log::warn!("Stream #{}: connect failed: {}", instance, e);
                self.transition(StreamState::Disconnected);
                let _ = events.send(StreamEvent::Disconnected { instance, reason: Some(e.to_string()) });
                return;
            }
            Err(_) => {
                log::warn!("Stream #{}: connect timed out after {:?}", instance, self.connect_timeout);
                self.transition(StreamState::Disconnected);
                let _ = events.send(StreamEvent::Disconnected {
                    instance,
                    reason: Some("connect timed out".to_string()),
                });
                return;
            }
        };

        self.transition(StreamState::Connected);
        log::info!("Stream #{}: connected", instance);
        if events.send(StreamEvent::Connected { instance }).is_err() {
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        let mut deadline = Instant::now() + self.inactivity_timeout;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    self.transition(StreamState::Disconnected);
                    log::info!("Stream #{}: closed by engine", instance);
                    return;
                }
                _ = sleep_until(deadline) => {
                    log::warn!(
                        "Stream #{}: no frames for {}s, closing",
                        instance,
                        self.inactivity_timeout.as_secs()
                    );
                    let _ = write.close().await;
                    break Some("inactivity timeout".to_string());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            deadline = Instant::now() + self.inactivity_timeout;
                            if !self.forward(text.as_str(), &events) {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bin))) => {
                            deadline = Instant::now() + self.inactivity_timeout;
                            match std::str::from_utf8(&bin) {
                                Ok(text) => {
                                    if !self.forward(text, &events) {
                                        return;
                                    }
                                }
                                Err(_) => log::warn!("Stream #{}: dropped non-UTF-8 binary frame", instance),
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // Heartbeats count as activity during quiet periods.
                            deadline = Instant::now() + self.inactivity_timeout;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Stream #{}: closed by remote ({:?})", instance, frame);
                            break None;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::error!("Stream #{}: read error: {}", instance, e);
                            break Some(e.to_string());
                        }
                        None => {
                            log::warn!("Stream #{}: closed by remote host", instance);
                            break None;
                        }
                    }
                }
            }
        };

        self.transition(StreamState::Disconnected);
        let _ = events.send(StreamEvent::Disconnected { instance, reason });
    }

    /// Parses and forwards one frame. `false` when the receiver is gone.
    fn forward(&self, text: &str, events: &mpsc::UnboundedSender<StreamEvent>) -> bool {
        match self.parse_frame(text) {
            Ok(Some(batch)) => {
                log::debug!("Stream #{}: batch of {} records", self.instance, batch.offers.len());
                events
                    .send(StreamEvent::Batch { instance: self.instance, batch })
                    .is_ok()
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("Stream #{}: dropped malformed frame: {}", self.instance, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> StreamSource {
        StreamSource::from_config(7, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn new_instance_is_disconnected() {
        let s = source();
        assert_eq!(s.state(), StreamState::Disconnected);
        assert_eq!(s.instance(), 7);
    }

    #[test]
    fn accepts_plain_and_feed_qualified_updates() {
        let s = source();
        let plain = s
            .parse_frame(r#"{"type":"update","offers":[{"model":"A100"}],"timestamp":"2024-05-01T12:00:00Z"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(plain.offers.len(), 1);
        assert!(plain.observed_at.is_some());

        let qualified = s
            .parse_frame(r#"{"type":"aws_spot_update","offers":[],"dataSource":"synthetic"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(qualified.data_source.as_deref(), Some("synthetic"));
    }

    #[test]
    fn ignores_unknown_types_and_rejects_garbage() {
        let s = source();
        assert_eq!(s.parse_frame(r#"{"type":"heartbeat"}"#).unwrap(), None);
        assert!(s.parse_frame("{not json").is_err());
        assert!(s.parse_frame(r#"{"offers":[]}"#).is_err());
    }

    /// Accepts one client, sends `frames`, then keeps the socket open until the
    /// client closes it.
    async fn serve_once(frames: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        });
        addr
    }

    fn local_config(addr: std::net::SocketAddr, inactivity: Duration) -> EngineConfig {
        EngineConfig {
            stream_url: Some(format!("ws://{}/ws/aws-spot", addr)),
            stream_inactivity_timeout: inactivity,
            request_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn silent_connection_is_closed_after_inactivity_timeout() {
        let addr = serve_once(vec![]).await;
        let s = StreamSource::from_config(3, &local_config(addr, Duration::from_millis(300))).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = Instant::now();
        s.run(tx, CancellationToken::new()).await;
        assert!(started.elapsed() >= Duration::from_millis(300));

        assert_eq!(rx.recv().await, Some(StreamEvent::Connected { instance: 3 }));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Disconnected {
                instance: 3,
                reason: Some("inactivity timeout".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let addr = serve_once(vec![
            "{not json",
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"aws_spot_update","offers":[{"model":"A100"}],"timestamp":"2024-05-01T12:00:00"}"#,
        ])
        .await;
        let s = StreamSource::from_config(4, &local_config(addr, Duration::from_secs(30))).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.run(tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(StreamEvent::Connected { instance: 4 }));
        match rx.recv().await {
            Some(StreamEvent::Batch { instance: 4, batch }) => {
                assert_eq!(batch.offers.len(), 1);
                assert!(batch.observed_at.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Closed by us: no Disconnected is reported.
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_disconnected() {
        let config = EngineConfig {
            // Port 9 (discard) on loopback is closed in test environments.
            stream_url: Some("ws://127.0.0.1:9/ws/aws-spot".into()),
            request_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let s = StreamSource::from_config(1, &config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.run(tx, CancellationToken::new()).await;

        match rx.recv().await {
            Some(StreamEvent::Disconnected { instance: 1, reason: Some(_) }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
