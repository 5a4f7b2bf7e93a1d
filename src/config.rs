//! Process configuration
//!
//! Layered as built-in defaults, then an optional TOML file, then
//! environment variables (after `.env` has been loaded).

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::feed::session::SessionConfig;

pub const DEFAULT_RIS_LIVE_URL: &str = "wss://ris-live.ripe.net/v1/ws/?client=reachwatch";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding events, origin outages, monitored prefixes and shared state
    pub db_path: String,

    pub feed: FeedConfig,
    pub tracking: TrackingConfig,
    pub enrichment: EnrichmentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "reachwatch.db".to_string(),
            feed: FeedConfig::default(),
            tracking: TrackingConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    /// Bootstrap prefixes, merged with the stored monitored set
    pub prefixes: Vec<String>,
    pub more_specific: bool,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Streaming time after which a disconnect refunds the reconnect budget
    pub min_healthy_stream_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub stale_data_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RIS_LIVE_URL.to_string(),
            prefixes: vec!["8.8.8.0/24".to_string()],
            more_specific: true,
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            max_reconnect_attempts: 5,
            min_healthy_stream_ms: 30_000,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            stale_data_timeout_ms: 120_000,
        }
    }
}

impl FeedConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            min_healthy_stream_ms: self.min_healthy_stream_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            ping_interval_ms: self.ping_interval_ms,
            pong_timeout_ms: self.pong_timeout_ms,
            stale_data_timeout_ms: self.stale_data_timeout_ms,
            ..SessionConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub ingest_workers: usize,
    pub ingest_queue_depth: usize,
    pub prefix_state_ttl_secs: u64,
    pub state_cache_max_entries: usize,
    pub origin_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub persist_retry_attempts: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            ingest_workers: 4,
            ingest_queue_depth: 1024,
            prefix_state_ttl_secs: 24 * 3600,
            state_cache_max_entries: 100_000,
            origin_idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            persist_retry_attempts: 3,
        }
    }
}

impl TrackingConfig {
    pub fn prefix_state_ttl(&self) -> Duration {
        Duration::from_secs(self.prefix_state_ttl_secs)
    }

    pub fn origin_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Origin number is appended to this URL
    pub url: String,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://stat.ripe.net/data/as-overview/data.json?resource=AS".to_string(),
            timeout_ms: 2_000,
            cache_ttl_secs: 24 * 3600,
        }
    }
}

impl EnrichmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Defaults overlaid with an optional TOML file and then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DB_PATH") {
            self.db_path = v;
        }

        if let Ok(v) = std::env::var("RIS_LIVE_URL") {
            self.feed.url = v;
        }
        if let Ok(v) = std::env::var("MONITORED_PREFIXES") {
            self.feed.prefixes = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("MORE_SPECIFIC") {
            self.feed.more_specific = v.parse().unwrap_or(self.feed.more_specific);
        }
        if let Ok(v) = std::env::var("FEED_BACKOFF_BASE_MS") {
            self.feed.backoff_base_ms = v.parse().unwrap_or(self.feed.backoff_base_ms);
        }
        if let Ok(v) = std::env::var("FEED_BACKOFF_MAX_MS") {
            self.feed.backoff_max_ms = v.parse().unwrap_or(self.feed.backoff_max_ms);
        }
        if let Ok(v) = std::env::var("FEED_MAX_RECONNECT_ATTEMPTS") {
            self.feed.max_reconnect_attempts =
                v.parse().unwrap_or(self.feed.max_reconnect_attempts);
        }
        if let Ok(v) = std::env::var("FEED_MIN_HEALTHY_STREAM_MS") {
            self.feed.min_healthy_stream_ms =
                v.parse().unwrap_or(self.feed.min_healthy_stream_ms);
        }
        if let Ok(v) = std::env::var("FEED_CONNECT_TIMEOUT_MS") {
            self.feed.connect_timeout_ms = v.parse().unwrap_or(self.feed.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("FEED_PING_INTERVAL_MS") {
            self.feed.ping_interval_ms = v.parse().unwrap_or(self.feed.ping_interval_ms);
        }
        if let Ok(v) = std::env::var("FEED_STALE_DATA_TIMEOUT_MS") {
            self.feed.stale_data_timeout_ms =
                v.parse().unwrap_or(self.feed.stale_data_timeout_ms);
        }

        if let Ok(v) = std::env::var("INGEST_WORKERS") {
            self.tracking.ingest_workers = v.parse().unwrap_or(self.tracking.ingest_workers);
        }
        if let Ok(v) = std::env::var("INGEST_QUEUE_DEPTH") {
            self.tracking.ingest_queue_depth =
                v.parse().unwrap_or(self.tracking.ingest_queue_depth);
        }
        if let Ok(v) = std::env::var("PREFIX_STATE_TTL_SECS") {
            self.tracking.prefix_state_ttl_secs =
                v.parse().unwrap_or(self.tracking.prefix_state_ttl_secs);
        }
        if let Ok(v) = std::env::var("STATE_CACHE_MAX_ENTRIES") {
            self.tracking.state_cache_max_entries =
                v.parse().unwrap_or(self.tracking.state_cache_max_entries);
        }
        if let Ok(v) = std::env::var("ORIGIN_IDLE_TIMEOUT_SECS") {
            self.tracking.origin_idle_timeout_secs =
                v.parse().unwrap_or(self.tracking.origin_idle_timeout_secs);
        }
        if let Ok(v) = std::env::var("SWEEP_INTERVAL_SECS") {
            self.tracking.sweep_interval_secs =
                v.parse().unwrap_or(self.tracking.sweep_interval_secs);
        }
        if let Ok(v) = std::env::var("PERSIST_RETRY_ATTEMPTS") {
            self.tracking.persist_retry_attempts =
                v.parse().unwrap_or(self.tracking.persist_retry_attempts);
        }

        if let Ok(v) = std::env::var("ENRICHMENT_ENABLED") {
            self.enrichment.enabled = v.parse().unwrap_or(self.enrichment.enabled);
        }
        if let Ok(v) = std::env::var("ENRICHMENT_URL") {
            self.enrichment.url = v;
        }
        if let Ok(v) = std::env::var("ENRICHMENT_TIMEOUT_MS") {
            self.enrichment.timeout_ms = v.parse().unwrap_or(self.enrichment.timeout_ms);
        }
    }
}
