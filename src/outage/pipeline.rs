//! Ingest pipeline between the feed and the tracker
//!
//! Updates are sharded by prefix hash onto bounded queues, one worker per
//! shard. A prefix always lands on the same shard, so its updates are applied
//! in arrival order; a full queue applies backpressure to the feed reader.
//! The pipeline also owns the periodic maintenance tasks: the correlator's
//! idle sweep and the purge of expired prefix state.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tracker::{PrefixReachabilityTracker, TrackerError};
use crate::feed::UpdateHandler;
use crate::models::{OutageEventKind, RouteUpdate};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub processed: AtomicU64,
    pub rejected: AtomicU64,
    pub processing_errors: AtomicU64,
    pub outages: AtomicU64,
    pub recoveries: AtomicU64,
    pub dropped_after_shutdown: AtomicU64,
}

impl PipelineStats {
    pub fn summary(&self) -> String {
        format!(
            "processed={} rejected={} errors={} outages={} recoveries={} dropped={}",
            self.processed.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.processing_errors.load(Ordering::Relaxed),
            self.outages.load(Ordering::Relaxed),
            self.recoveries.load(Ordering::Relaxed),
            self.dropped_after_shutdown.load(Ordering::Relaxed),
        )
    }
}

pub struct IngestPipeline {
    tracker: Arc<PrefixReachabilityTracker>,
    shards: RwLock<Vec<mpsc::Sender<RouteUpdate>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<PipelineStats>,
}

impl IngestPipeline {
    /// Spawn `workers` shard workers and the maintenance tasks
    pub fn start(
        tracker: Arc<PrefixReachabilityTracker>,
        workers: usize,
        queue_depth: usize,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let stats = Arc::new(PipelineStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_shard(shard, rx, tracker.clone(), stats.clone())));
        }

        let maintenance = vec![
            tracker
                .correlator()
                .spawn_idle_sweep(sweep_interval, shutdown_rx.clone()),
            spawn_state_purge(tracker.clone(), sweep_interval, shutdown_rx),
        ];

        info!(workers, queue_depth, sweep_secs = sweep_interval.as_secs(), "ingest_pipeline_started");

        Arc::new(Self {
            tracker,
            shards: RwLock::new(senders),
            workers: Mutex::new(handles),
            maintenance: Mutex::new(maintenance),
            shutdown_tx,
            stats,
        })
    }

    /// Reopen origin windows for prefixes that were down when the process
    /// last stopped. Only outages with activity inside the idle timeout are
    /// restored; older ones were already closed by a sweep.
    pub async fn restore_from_store(&self, idle_timeout: Duration) -> Result<usize> {
        let states = self.tracker.store().scan().await?;
        let idle = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let now = Utc::now();
        let correlator = self.tracker.correlator();

        let mut restored = 0;
        for state in states {
            if !state.is_down() || state.withdrawn_by.is_empty() {
                continue;
            }
            if now - state.last_update >= idle {
                continue;
            }
            correlator.restore(&state.origin_or_unknown(), &state.prefix, state.last_update);
            restored += 1;
        }
        info!(restored, windows = correlator.open_window_count(), "outage_windows_restored");
        Ok(restored)
    }

    fn shard_for(prefix: &str, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        (hasher.finish() as usize) % shards
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn tracker(&self) -> &Arc<PrefixReachabilityTracker> {
        &self.tracker
    }

    /// Drain queued updates, stop workers and maintenance tasks
    pub async fn shutdown(&self) {
        // Dropping the senders lets each worker finish its queue and exit
        self.shards.write().clear();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest_worker_join_failed");
            }
        }

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.maintenance.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(stats = %self.stats.summary(), "ingest_pipeline_stopped");
    }
}

#[async_trait]
impl UpdateHandler for IngestPipeline {
    async fn handle(&self, update: RouteUpdate) {
        let sender = {
            let shards = self.shards.read();
            if shards.is_empty() {
                None
            } else {
                Some(shards[Self::shard_for(&update.prefix, shards.len())].clone())
            }
        };

        let Some(sender) = sender else {
            self.stats.dropped_after_shutdown.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if sender.send(update).await.is_err() {
            self.stats.dropped_after_shutdown.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn spawn_state_purge(
    tracker: Arc<PrefixReachabilityTracker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tracker.store().purge_expired().await {
                        warn!(error = %e, "state_purge_failed");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        debug!("state_purge_stopped");
    })
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<RouteUpdate>,
    tracker: Arc<PrefixReachabilityTracker>,
    stats: Arc<PipelineStats>,
) {
    debug!(shard, "ingest_worker_started");
    while let Some(update) = rx.recv().await {
        stats.processed.fetch_add(1, Ordering::Relaxed);
        match tracker.apply_update(&update).await {
            Ok(Some(event)) => match event.kind {
                OutageEventKind::OutageStarted => {
                    stats.outages.fetch_add(1, Ordering::Relaxed);
                }
                OutageEventKind::RecoveryDetected => {
                    stats.recoveries.fetch_add(1, Ordering::Relaxed);
                }
            },
            Ok(None) => {}
            Err(TrackerError::Rejected(reason)) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(prefix = %update.prefix, vantage_point = %update.vantage_point, reason = %reason, "update_rejected");
            }
            Err(e @ TrackerError::Persistence(_)) => {
                stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                warn!(prefix = %update.prefix, error = %e, "update_processing_failed");
            }
        }
    }
    debug!(shard, "ingest_worker_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_assignment_stable() {
        let a = IngestPipeline::shard_for("203.0.113.0/24", 8);
        for _ in 0..10 {
            assert_eq!(IngestPipeline::shard_for("203.0.113.0/24", 8), a);
        }
        assert!(a < 8);
        assert_eq!(IngestPipeline::shard_for("203.0.113.0/24", 1), 0);
    }
}
