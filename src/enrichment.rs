//! Origin metadata lookup
//!
//! Used only to annotate closed origin outages. Lookups go to an HTTP
//! directory first and fall back to a small table of well-known networks;
//! results are cached in memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Coordinates, OriginMeta, UNKNOWN_ORIGIN};

#[async_trait]
pub trait OriginDirectory: Send + Sync {
    async fn lookup_origin_meta(&self, origin_id: &str) -> Result<OriginMeta>;
}

const WELL_KNOWN_ORIGINS: &[(&str, &str)] = &[
    ("15169", "Google LLC"),
    ("32934", "Facebook, Inc."),
    ("14618", "Amazon.com, Inc."),
    ("8075", "Microsoft Corporation"),
    ("174", "Cogent Communications"),
    ("3356", "Level 3 Communications"),
    ("701", "Verizon Business"),
    ("6453", "Tata Communications"),
    ("1299", "Telia Company AB"),
    ("3257", "GTT Communications"),
];

/// Offline directory: well-known names, `AS<n>` otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticOriginDirectory;

impl StaticOriginDirectory {
    pub fn describe(origin_id: &str) -> OriginMeta {
        if origin_id.is_empty() || origin_id == UNKNOWN_ORIGIN {
            return OriginMeta::unknown();
        }
        let name = WELL_KNOWN_ORIGINS
            .iter()
            .find(|(id, _)| *id == origin_id)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("AS{}", origin_id));
        OriginMeta {
            name,
            region: "Unknown".to_string(),
            coordinates: None,
        }
    }
}

#[async_trait]
impl OriginDirectory for StaticOriginDirectory {
    async fn lookup_origin_meta(&self, origin_id: &str) -> Result<OriginMeta> {
        Ok(Self::describe(origin_id))
    }
}

/// JSON directory reached at `<base_url><origin>`
pub struct HttpOriginDirectory {
    client: Client,
    base_url: String,
}

impl HttpOriginDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build enrichment HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    /// Accepts both `data.{holder|name,country_code}` and
    /// `data.asn.{name,country_code}` response shapes.
    pub fn parse_response(body: &Value) -> Option<OriginMeta> {
        let data = body.get("data")?;
        let record = data.get("asn").filter(|v| v.is_object()).unwrap_or(data);

        let name = record
            .get("holder")
            .or_else(|| record.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())?
            .to_string();
        let region = record
            .get("country_code")
            .or_else(|| record.get("country"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown")
            .to_string();
        let coordinates = match (
            record.get("latitude").and_then(Value::as_f64),
            record.get("longitude").and_then(Value::as_f64),
        ) {
            (Some(latitude), Some(longitude)) if latitude != 0.0 || longitude != 0.0 => {
                Some(Coordinates {
                    latitude,
                    longitude,
                })
            }
            _ => None,
        };

        Some(OriginMeta {
            name,
            region,
            coordinates,
        })
    }
}

#[async_trait]
impl OriginDirectory for HttpOriginDirectory {
    async fn lookup_origin_meta(&self, origin_id: &str) -> Result<OriginMeta> {
        let url = format!("{}{}", self.base_url, origin_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow::anyhow!("GET {}: {}", url, status));
        }

        let body = resp
            .json::<Value>()
            .await
            .context("Failed to parse origin directory response")?;
        Self::parse_response(&body)
            .with_context(|| format!("No origin record for {}", origin_id))
    }
}

/// Memoizes a primary directory, falling back to the static table on error
pub struct CachedOriginDirectory {
    primary: Arc<dyn OriginDirectory>,
    cache: DashMap<String, (OriginMeta, Instant)>,
    ttl: Duration,
}

impl CachedOriginDirectory {
    pub fn new(primary: Arc<dyn OriginDirectory>, ttl: Duration) -> Self {
        Self {
            primary,
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl OriginDirectory for CachedOriginDirectory {
    async fn lookup_origin_meta(&self, origin_id: &str) -> Result<OriginMeta> {
        if let Some(entry) = self.cache.get(origin_id) {
            let (meta, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Ok(meta.clone());
            }
        }

        let meta = match self.primary.lookup_origin_meta(origin_id).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(origin = origin_id, error = %e, "origin_lookup_failed");
                StaticOriginDirectory::describe(origin_id)
            }
        };
        debug!(origin = origin_id, name = %meta.name, "origin_meta_cached");
        self.cache.insert(
            origin_id.to_string(),
            (meta.clone(), Instant::now() + self.ttl),
        );
        Ok(meta)
    }
}
