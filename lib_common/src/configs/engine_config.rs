//! # Engine Configuration
//!
//! Explicit configuration for the offer engine. Everything the engine needs
//! to know about its upstream (URLs, feed name, intervals, retry and
//! reconnect policy, default filters) is carried here and passed in at
//! construction; nothing is read from the environment inside the library.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::markets::gpu::model::FilterParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL in '{field}': {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// # Engine Config
///
/// JSON representation is camelCase; durations are integer fields suffixed
/// with their unit (`pollIntervalSecs`, `retrySpacingMs`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Base URL of the REST API, e.g. `http://localhost:8000`.
    pub base_url: String,
    /// Stream endpoint. Derived from `base_url` and `feed` when unset.
    pub stream_url: Option<String>,
    /// Feed name used in endpoint paths (`/api/{feed}/prices`).
    pub feed: String,
    /// Disable to run poll-only.
    pub stream_enabled: bool,

    #[serde(rename = "pollIntervalSecs", with = "secs")]
    pub poll_interval: Duration,
    #[serde(rename = "summaryIntervalSecs", with = "secs")]
    pub summary_interval: Duration,
    /// Attempts per poll round-trip, first try included.
    pub retry_attempts: u32,
    #[serde(rename = "retrySpacingMs", with = "millis")]
    pub retry_spacing: Duration,
    #[serde(rename = "reconnectBaseDelayMs", with = "millis")]
    pub reconnect_base_delay: Duration,
    #[serde(rename = "reconnectMaxDelayMs", with = "millis")]
    pub reconnect_max_delay: Duration,
    /// A connected stream silent for this long is closed.
    #[serde(rename = "streamInactivityTimeoutSecs", with = "secs")]
    pub stream_inactivity_timeout: Duration,
    #[serde(rename = "requestTimeoutSecs", with = "secs")]
    pub request_timeout: Duration,

    pub default_filters: FilterParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_url: None,
            feed: "aws-spot".to_string(),
            stream_enabled: true,
            poll_interval: Duration::from_secs(30),
            summary_interval: Duration::from_secs(60),
            retry_attempts: 3,
            retry_spacing: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            stream_inactivity_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(10),
            default_filters: FilterParams::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks URLs parse with a usable scheme and every interval is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "baseUrl must be http(s), got '{}'",
                base.scheme()
            )));
        }
        if self.stream_enabled {
            let stream = self.stream_url()?;
            if !matches!(stream.scheme(), "ws" | "wss") {
                return Err(ConfigError::Invalid(format!(
                    "streamUrl must be ws(s), got '{}'",
                    stream.scheme()
                )));
            }
        }
        if self.feed.trim().is_empty() || self.feed.contains('/') {
            return Err(ConfigError::Invalid(format!("feed '{}' is not a path segment", self.feed)));
        }

        let intervals = [
            ("pollIntervalSecs", self.poll_interval),
            ("summaryIntervalSecs", self.summary_interval),
            ("reconnectBaseDelayMs", self.reconnect_base_delay),
            ("reconnectMaxDelayMs", self.reconnect_max_delay),
            ("streamInactivityTimeoutSecs", self.stream_inactivity_timeout),
            ("requestTimeoutSecs", self.request_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retryAttempts must be at least 1".into()));
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(ConfigError::Invalid(
                "reconnectMaxDelayMs must not be below reconnectBaseDelayMs".into(),
            ));
        }
        Ok(())
    }

    /// Parsed `base_url`.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidUrl { field: "baseUrl", source })
    }

    /// Explicit `stream_url`, or `ws(s)://<base host>/ws/{feed}`.
    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        if let Some(explicit) = &self.stream_url {
            return Url::parse(explicit)
                .map_err(|source| ConfigError::InvalidUrl { field: "streamUrl", source });
        }

        let mut url = self.base_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot derive stream URL from '{}'", self.base_url)))?;
        url.set_path(&format!("/ws/{}", self.feed));
        url.set_query(None);
        Ok(url)
    }

    /// Relative path of a REST endpoint of this feed, e.g. `api/aws-spot/prices`.
    pub fn endpoint(&self, name: &str) -> String {
        format!("api/{}/{}", self.feed, name)
    }

    /// Frame `type` values accepted from the stream: `update` and the
    /// feed-qualified form (`aws_spot_update`).
    pub fn stream_frame_types(&self) -> Vec<String> {
        vec!["update".to_string(), format!("{}_update", self.feed.replace('-', "_"))]
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig
    Feed: {},
    Base URL: {},
    Stream: {},
    Poll interval: {:?}, retries: {} x {:?},
    Reconnect: {:?}..{:?}",
            self.feed,
            self.base_url,
            if self.stream_enabled {
                self.stream_url.as_deref().unwrap_or("(derived)")
            } else {
                "(disabled)"
            },
            self.poll_interval,
            self.retry_attempts,
            self.retry_spacing,
            self.reconnect_base_delay,
            self.reconnect_max_delay
        )
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
