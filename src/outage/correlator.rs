//! Origin-level outage correlation
//!
//! Prefix outages sharing an origin are grouped into one window per origin.
//! A window closes exactly once: when its last down prefix recovers (drained)
//! or when the idle sweep finds no activity for the idle timeout (timed out).
//! A recurrence after closure opens a fresh window.
//!
//! Window times are processing times, not the feed's observation timestamps,
//! so a lagging or replayed feed cannot open a window that is already idle.
//!
//! Windows live in a DashMap, so ingestion and the sweep serialize per shard
//! rather than on one global lock. Closure removes the window under its shard
//! lock (`remove_if`) and only then does the async persist work.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::enrichment::OriginDirectory;
use crate::models::{ClosureReason, OriginMeta, OriginOutage, OutageEvent};
use crate::storage::{with_retry, EventSink};

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub idle_timeout: Duration,
    pub enrichment_timeout: Duration,
    pub persist_retry_attempts: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            enrichment_timeout: Duration::from_secs(2),
            persist_retry_attempts: 3,
        }
    }
}

/// Live window for one origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginOutageWindow {
    pub origin_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Prefixes under this origin that are down right now
    pub affected_prefixes: BTreeSet<String>,
    /// Every prefix that went down while the window was open
    pub seen_prefixes: BTreeSet<String>,
}

impl OriginOutageWindow {
    fn open(origin_id: &str, started: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            origin_id: origin_id.to_string(),
            start_time: started,
            last_activity: now,
            affected_prefixes: BTreeSet::new(),
            seen_prefixes: BTreeSet::new(),
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, idle: chrono::Duration) -> bool {
        now - self.last_activity >= idle
    }
}

pub struct OriginCorrelator {
    windows: DashMap<String, OriginOutageWindow>,
    sink: Arc<dyn EventSink>,
    directory: Arc<dyn OriginDirectory>,
    config: CorrelatorConfig,
}

impl OriginCorrelator {
    pub fn new(
        sink: Arc<dyn EventSink>,
        directory: Arc<dyn OriginDirectory>,
        config: CorrelatorConfig,
    ) -> Self {
        Self {
            windows: DashMap::new(),
            sink,
            directory,
            config,
        }
    }

    pub fn on_outage_started(&self, event: &OutageEvent) {
        self.on_outage_started_at(event, Utc::now());
    }

    pub fn on_outage_started_at(&self, event: &OutageEvent, now: DateTime<Utc>) {
        self.add_to_window(&event.origin_id, &event.prefix, now, now);
    }

    /// Reopen a window for a prefix found down at startup. The window keeps
    /// the stored down time as its start but counts as active from now.
    pub fn restore(&self, origin_id: &str, prefix: &str, down_since: DateTime<Utc>) {
        self.add_to_window(origin_id, prefix, down_since, Utc::now());
    }

    fn add_to_window(&self, origin_id: &str, prefix: &str, started: DateTime<Utc>, now: DateTime<Utc>) {
        let mut window = self.windows.entry(origin_id.to_string()).or_insert_with(|| {
            info!(origin = origin_id, "origin_window_opened");
            OriginOutageWindow::open(origin_id, started, now)
        });
        if started < window.start_time {
            window.start_time = started;
        }
        window.affected_prefixes.insert(prefix.to_string());
        window.seen_prefixes.insert(prefix.to_string());
        window.touch(now);
        debug!(
            origin = origin_id,
            prefix,
            affected = window.affected_prefixes.len(),
            "origin_window_prefix_down"
        );
    }

    /// Returns the closed outage when this recovery drained the window
    pub async fn on_recovery_detected(&self, event: &OutageEvent) -> Option<OriginOutage> {
        self.on_recovery_detected_at(event, Utc::now()).await
    }

    pub async fn on_recovery_detected_at(
        &self,
        event: &OutageEvent,
        now: DateTime<Utc>,
    ) -> Option<OriginOutage> {
        let drained = {
            let Some(mut window) = self.windows.get_mut(&event.origin_id) else {
                debug!(origin = %event.origin_id, prefix = %event.prefix, "recovery_without_window");
                return None;
            };
            window.affected_prefixes.remove(&event.prefix);
            window.touch(now);
            window.affected_prefixes.is_empty()
        };

        if !drained {
            return None;
        }

        // Re-checked under the shard lock: a concurrent outage or sweep may have won
        let (_, window) = self
            .windows
            .remove_if(&event.origin_id, |_, w| w.affected_prefixes.is_empty())?;
        Some(self.close_window(window, ClosureReason::Drained, now).await)
    }

    /// Close every window idle for at least the idle timeout
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<OriginOutage> {
        let idle = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let candidates: Vec<String> = self
            .windows
            .iter()
            .filter(|w| w.is_idle(now, idle))
            .map(|w| w.key().clone())
            .collect();

        let mut closed = Vec::with_capacity(candidates.len());
        for origin in candidates {
            if let Some((_, window)) = self.windows.remove_if(&origin, |_, w| w.is_idle(now, idle)) {
                closed.push(self.close_window(window, ClosureReason::TimedOut, now).await);
            }
        }

        if !closed.is_empty() {
            info!(closed = closed.len(), open = self.windows.len(), "idle_sweep");
        }
        closed
    }

    async fn close_window(
        &self,
        window: OriginOutageWindow,
        closure: ClosureReason,
        end_time: DateTime<Utc>,
    ) -> OriginOutage {
        let affected = window.seen_prefixes.len() as u64;
        let severity = match self.sink.known_prefix_count(&window.origin_id).await {
            Ok(Some(known)) if known > 0 => ((affected * 100) / known).min(100) as u8,
            Ok(_) => 100,
            Err(e) => {
                warn!(origin = %window.origin_id, error = %e, "known_prefix_count_failed");
                100
            }
        };

        let meta = match tokio::time::timeout(
            self.config.enrichment_timeout,
            self.directory.lookup_origin_meta(&window.origin_id),
        )
        .await
        {
            Ok(Ok(meta)) => meta,
            Ok(Err(e)) => {
                warn!(origin = %window.origin_id, error = %e, "origin_enrichment_failed");
                OriginMeta::unknown()
            }
            Err(_) => {
                warn!(origin = %window.origin_id, "origin_enrichment_timeout");
                OriginMeta::unknown()
            }
        };

        let outage = OriginOutage {
            id: uuid::Uuid::new_v4().to_string(),
            origin_id: window.origin_id.clone(),
            start_time: window.start_time,
            end_time,
            duration_secs: (end_time - window.start_time).num_seconds().max(0),
            affected_prefixes: window.seen_prefixes.into_iter().collect(),
            unresolved_prefixes: window.affected_prefixes.into_iter().collect(),
            severity,
            closure,
            origin_name: meta.name,
            region: meta.region,
            coordinates: meta.coordinates,
        };

        if let Err(e) = with_retry("append_origin_outage", self.config.persist_retry_attempts, || {
            self.sink.append_origin_outage(&outage)
        })
        .await
        {
            error!(origin = %outage.origin_id, error = %e, "origin_outage_persist_failed");
        }

        info!(
            origin = %outage.origin_id,
            closure = %outage.closure,
            affected = outage.affected_prefixes.len(),
            unresolved = outage.unresolved_prefixes.len(),
            severity = outage.severity,
            duration_secs = outage.duration_secs,
            "origin_window_closed"
        );
        outage
    }

    pub fn window(&self, origin_id: &str) -> Option<OriginOutageWindow> {
        self.windows.get(origin_id).map(|w| w.value().clone())
    }

    pub fn open_windows(&self) -> Vec<OriginOutageWindow> {
        self.windows.iter().map(|w| w.value().clone()).collect()
    }

    pub fn open_window_count(&self) -> usize {
        self.windows.len()
    }

    /// Run `sweep_idle` every `every` until `shutdown` flips to true
    pub fn spawn_idle_sweep(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        correlator.sweep_idle(Utc::now()).await;
                    }
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
            debug!("idle_sweep_stopped");
        })
    }
}
