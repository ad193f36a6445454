use std::path::PathBuf;
use std::{fs, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use lib_common::configs::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "GPU offer snapshot server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "OFFERS_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "OFFERS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "OFFERS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "OFFERS_LOG_LEVEL", help = "Logging level (debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "OFFERS_ENGINE_CONFIG", help = "Path to an engine JSON config used as the base for the engine settings.")]
    pub engine_config_path: Option<PathBuf>,

    #[clap(long, env = "OFFERS_BASE_URL", help = "Base URL of the upstream REST API.")]
    pub base_url: Option<String>,

    #[clap(long, env = "OFFERS_STREAM_URL", help = "Upstream WebSocket URL. Derived from the base URL when unset.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "OFFERS_FEED", help = "Feed name used in upstream paths.")]
    pub feed: Option<String>,

    #[clap(long, env = "OFFERS_STREAM_ENABLED", help = "Set to false to run poll-only.")]
    pub stream_enabled: Option<bool>,

    #[clap(long, env = "OFFERS_POLL_INTERVAL_SECONDS", help = "Seconds between REST polls.")]
    pub poll_interval_seconds: Option<u64>,

    #[clap(long, env = "OFFERS_RETRY_ATTEMPTS", help = "Attempts per poll round-trip.")]
    pub retry_attempts: Option<u32>,

    #[clap(long, env = "OFFERS_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for stream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "OFFERS_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for stream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            engine_config_path: other.engine_config_path.or(self.engine_config_path),
            base_url: other.base_url.or(self.base_url),
            stream_url: other.stream_url.or(self.stream_url),
            feed: other.feed.or(self.feed),
            stream_enabled: other.stream_enabled.or(self.stream_enabled),
            poll_interval_seconds: other.poll_interval_seconds.or(self.poll_interval_seconds),
            retry_attempts: other.retry_attempts.or(self.retry_attempts),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9003)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Engine settings: the engine config file (or engine defaults) with
    /// every field set here laid over it.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut engine = match &self.engine_config_path {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("loading engine config {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(v) = &self.base_url {
            engine.base_url = v.clone();
        }
        if let Some(v) = &self.stream_url {
            engine.stream_url = Some(v.clone());
        }
        if let Some(v) = &self.feed {
            engine.feed = v.clone();
        }
        if let Some(v) = self.stream_enabled {
            engine.stream_enabled = v;
        }
        if let Some(v) = self.poll_interval_seconds {
            engine.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.retry_attempts {
            engine.retry_attempts = v;
        }
        if let Some(v) = self.reconnect_base_delay_ms {
            engine.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_max_delay_ms {
            engine.reconnect_max_delay = Duration::from_millis(v);
        }

        engine.validate()?;
        Ok(engine)
    }
}

/// Defaults < config file < environment < CLI flags.
pub fn load_config() -> Config {
    let cli = Config::parse();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_offers.conf"));

    let with_file = merge_file(Config::defaults(), &config_file_path);
    with_file.merge(cli)
}

fn merge_file(base: Config, path: &PathBuf) -> Config {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return base;
    }
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Config>(&raw) {
            Ok(file_config) => base.merge(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                base
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn later_sources_override_earlier_ones() {
        let file = Config { port: Some(1), feed: Some("gcp-spot".into()), ..Default::default() };
        let cli = Config { port: Some(2), ..Default::default() };
        let merged = Config::defaults().merge(file).merge(cli);
        assert_eq!(merged.port(), 2);
        assert_eq!(merged.feed.as_deref(), Some("gcp-spot"));
        assert_eq!(merged.log_level(), "info");
    }

    #[test]
    fn config_file_is_merged_and_bad_file_ignored() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        write!(good, r#"{{"port": 7000, "pollIntervalSeconds": 5}}"#).unwrap();
        let merged = merge_file(Config::defaults(), &good.path().to_path_buf());
        assert_eq!(merged.port(), 7000);
        assert_eq!(merged.poll_interval_seconds, Some(5));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "not json").unwrap();
        assert_eq!(merge_file(Config::defaults(), &bad.path().to_path_buf()), Config::defaults());
    }

    #[test]
    fn engine_config_overlays_set_fields() {
        let config = Config {
            base_url: Some("http://upstream:8000".into()),
            stream_enabled: Some(false),
            poll_interval_seconds: Some(10),
            ..Config::defaults()
        };
        let engine = config.engine_config().unwrap();
        assert_eq!(engine.base_url, "http://upstream:8000");
        assert!(!engine.stream_enabled);
        assert_eq!(engine.poll_interval, Duration::from_secs(10));
        assert_eq!(engine.feed, "aws-spot");
    }

    #[test]
    fn invalid_engine_settings_are_reported() {
        let config = Config { retry_attempts: Some(0), ..Config::defaults() };
        assert!(config.engine_config().is_err());
    }
}
