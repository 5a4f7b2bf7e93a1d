//! Per-prefix reachability state machine
//!
//! Each update is applied under a striped lock keyed by prefix, so updates
//! for one prefix are serialized while different prefixes proceed in
//! parallel. State is persisted write-through on every update; a transition
//! produces an [`OutageEvent`] that is appended to the sink and handed to
//! the origin correlator.
//!
//! Transitions:
//! - Withdraw that empties `visible_by` (or is the first thing ever seen for
//!   the prefix): `OutageStarted`
//! - Announce while the prefix is down: `RecoveryDetected`, then
//!   `withdrawn_by` is cleared
//! - Anything else only refreshes the stored state

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::correlator::OriginCorrelator;
use crate::models::{OutageEvent, OutageEventKind, PrefixState, RouteUpdate, UpdateKind};
use crate::storage::{with_retry, EventSink, StateStore};

const LOCK_STRIPES: usize = 256;

/// Why an update was refused before touching any state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRejected {
    MissingPrefix,
    MissingVantagePoint,
    InvalidPrefix(String),
}

impl std::fmt::Display for UpdateRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateRejected::MissingPrefix => write!(f, "update has no prefix"),
            UpdateRejected::MissingVantagePoint => write!(f, "update has no vantage point"),
            UpdateRejected::InvalidPrefix(p) => write!(f, "invalid prefix: {}", p),
        }
    }
}

impl std::error::Error for UpdateRejected {}

#[derive(Debug)]
pub enum TrackerError {
    Rejected(UpdateRejected),
    /// Store or sink still failing after retries
    Persistence(anyhow::Error),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::Rejected(r) => write!(f, "update rejected: {}", r),
            TrackerError::Persistence(e) => write!(f, "persistence failed: {:#}", e),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<UpdateRejected> for TrackerError {
    fn from(r: UpdateRejected) -> Self {
        TrackerError::Rejected(r)
    }
}

/// Parse `addr/len` loosely: valid IP address and a length within its family
pub fn validate_prefix(prefix: &str) -> Result<(), UpdateRejected> {
    let invalid = || UpdateRejected::InvalidPrefix(prefix.to_string());
    let (addr, len) = prefix.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_update(update: &RouteUpdate) -> Result<(), UpdateRejected> {
    if update.prefix.trim().is_empty() {
        return Err(UpdateRejected::MissingPrefix);
    }
    if update.vantage_point.trim().is_empty() {
        return Err(UpdateRejected::MissingVantagePoint);
    }
    validate_prefix(&update.prefix)
}

/// Apply an announcement. `is_new` marks a state that was never stored.
fn apply_announce(state: &mut PrefixState, update: &RouteUpdate, is_new: bool) -> Option<OutageEvent> {
    let was_down = state.is_down() && !is_new;
    // Origin the outage was recorded under, before this update can change it
    let outage_origin = state.origin_or_unknown();

    state.visible_by.insert(update.vantage_point.clone());
    if let Some(origin) = &update.origin_id {
        state.origin_id = Some(origin.clone());
    }
    if let Some(path) = update.path_string() {
        state.last_path = Some(path);
    }
    state.last_update = update.observed_at;

    if !was_down {
        return None;
    }

    let mut event = OutageEvent::recovery_detected(state);
    event.origin_id = outage_origin;
    state.withdrawn_by.clear();
    Some(event)
}

fn apply_withdraw(state: &mut PrefixState, update: &RouteUpdate, is_new: bool) -> Option<OutageEvent> {
    let was_up = !state.is_down() || is_new;

    state.visible_by.remove(&update.vantage_point);
    state.withdrawn_by.insert(update.vantage_point.clone());
    if let Some(origin) = &update.origin_id {
        state.origin_id = Some(origin.clone());
    }
    state.last_update = update.observed_at;

    if was_up && state.is_down() {
        Some(OutageEvent::outage_started(state))
    } else {
        None
    }
}

pub struct PrefixReachabilityTracker {
    store: Arc<StateStore>,
    sink: Arc<dyn EventSink>,
    correlator: Arc<OriginCorrelator>,
    state_ttl: Duration,
    retry_attempts: u32,
    locks: Vec<Mutex<()>>,
}

impl PrefixReachabilityTracker {
    pub fn new(
        store: Arc<StateStore>,
        sink: Arc<dyn EventSink>,
        correlator: Arc<OriginCorrelator>,
        state_ttl: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            sink,
            correlator,
            state_ttl,
            retry_attempts,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock_prefix(&self, prefix: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.locks.len();
        self.locks[idx].lock().await
    }

    /// Apply one update; returns the transition event, if any.
    ///
    /// Rejected updates leave state untouched. If the state write succeeds but
    /// the event append does not, the transition still reaches the correlator
    /// and the error is returned.
    pub async fn apply_update(&self, update: &RouteUpdate) -> Result<Option<OutageEvent>, TrackerError> {
        validate_update(update)?;
        let _guard = self.lock_prefix(&update.prefix).await;

        let existing = with_retry("state_get", self.retry_attempts, || {
            self.store.get(&update.prefix)
        })
        .await
        .map_err(TrackerError::Persistence)?;

        let is_new = existing.is_none();
        let mut state = existing.unwrap_or_else(|| PrefixState::new(&update.prefix, update.observed_at));

        let event = match update.kind {
            UpdateKind::Announce => apply_announce(&mut state, update, is_new),
            UpdateKind::Withdraw => apply_withdraw(&mut state, update, is_new),
        };

        with_retry("state_put", self.retry_attempts, || {
            self.store.put(&state.prefix, &state, self.state_ttl)
        })
        .await
        .map_err(TrackerError::Persistence)?;

        debug!(
            prefix = %state.prefix,
            kind = update.kind.as_str(),
            vantage_point = %update.vantage_point,
            visible = state.visible_by.len(),
            withdrawn = state.withdrawn_by.len(),
            "prefix_update_applied"
        );

        let Some(event) = event else {
            return Ok(None);
        };

        let appended = with_retry("append_event", self.retry_attempts, || {
            self.sink.append_event(&event)
        })
        .await;

        match event.kind {
            OutageEventKind::OutageStarted => {
                info!(
                    prefix = %event.prefix,
                    origin = %event.origin_id,
                    withdrawn_by = ?event.withdrawn_by,
                    "prefix_outage_started"
                );
                self.correlator.on_outage_started(&event);
            }
            OutageEventKind::RecoveryDetected => {
                info!(
                    prefix = %event.prefix,
                    origin = %event.origin_id,
                    "prefix_recovered"
                );
                self.correlator.on_recovery_detected(&event).await;
            }
        }

        if let Err(e) = appended {
            warn!(prefix = %event.prefix, kind = %event.kind, "event_not_recorded");
            return Err(TrackerError::Persistence(e));
        }
        Ok(Some(event))
    }

    pub fn correlator(&self) -> &Arc<OriginCorrelator> {
        &self.correlator
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn announce(vp: &str) -> RouteUpdate {
        RouteUpdate::announce("203.0.113.0/24", vp, &["3333", "64500"])
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("203.0.113.0/24").is_ok());
        assert!(validate_prefix("2001:db8::/32").is_ok());
        assert!(validate_prefix("203.0.113.0").is_err());
        assert!(validate_prefix("203.0.113.0/33").is_err());
        assert!(validate_prefix("not-an-ip/8").is_err());
    }

    #[test]
    fn test_validate_update() {
        let mut u = announce("rrc01");
        assert!(validate_update(&u).is_ok());
        u.vantage_point.clear();
        assert_eq!(validate_update(&u), Err(UpdateRejected::MissingVantagePoint));
        u.prefix.clear();
        assert_eq!(validate_update(&u), Err(UpdateRejected::MissingPrefix));
    }

    #[test]
    fn test_last_withdraw_starts_outage() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        assert!(apply_announce(&mut s, &announce("rrc01"), true).is_none());
        assert!(apply_announce(&mut s, &announce("rrc02"), false).is_none());

        let w1 = RouteUpdate::withdraw("203.0.113.0/24", "rrc01");
        assert!(apply_withdraw(&mut s, &w1, false).is_none());

        let w2 = RouteUpdate::withdraw("203.0.113.0/24", "rrc02");
        let ev = apply_withdraw(&mut s, &w2, false).unwrap();
        assert_eq!(ev.kind, OutageEventKind::OutageStarted);
        assert_eq!(ev.origin_id, "64500");
        assert_eq!(ev.last_path.as_deref(), Some("3333 64500"));
        assert_eq!(ev.withdrawn_by, vec!["rrc01", "rrc02"]);

        // Already down: further withdrawals are silent
        assert!(apply_withdraw(&mut s, &w2, false).is_none());
    }

    #[test]
    fn test_announce_while_down_recovers_and_clears() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        apply_announce(&mut s, &announce("rrc01"), true);
        apply_withdraw(&mut s, &RouteUpdate::withdraw("203.0.113.0/24", "rrc01"), false);

        let ev = apply_announce(&mut s, &announce("rrc02"), false).unwrap();
        assert_eq!(ev.kind, OutageEventKind::RecoveryDetected);
        assert_eq!(ev.withdrawn_by, vec!["rrc01"]);
        assert!(ev.resolved_at.is_some());
        assert!(s.withdrawn_by.is_empty());
        assert!(!s.is_down());
    }

    #[test]
    fn test_recovery_keeps_outage_origin() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        apply_announce(&mut s, &announce("rrc01"), true);
        apply_withdraw(&mut s, &RouteUpdate::withdraw("203.0.113.0/24", "rrc01"), false);

        let moved = RouteUpdate::announce("203.0.113.0/24", "rrc01", &["3333", "64999"]);
        let ev = apply_announce(&mut s, &moved, false).unwrap();
        assert_eq!(ev.origin_id, "64500");
        assert_eq!(s.origin_id.as_deref(), Some("64999"));
    }

    #[test]
    fn test_first_seen_withdraw_is_outage() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        let ev = apply_withdraw(&mut s, &RouteUpdate::withdraw("203.0.113.0/24", "rrc01"), true).unwrap();
        assert_eq!(ev.origin_id, "0");

        // Recovery must land in the same origin window as the outage
        let recovered = apply_announce(&mut s, &announce("rrc01"), false).unwrap();
        assert_eq!(recovered.origin_id, ev.origin_id);
        assert_eq!(s.origin_id.as_deref(), Some("64500"));
    }

    #[test]
    fn test_duplicate_announce_only_refreshes() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        apply_announce(&mut s, &announce("rrc01"), true);
        let later = Utc::now() + chrono::Duration::seconds(5);
        let dup = RouteUpdate::announce("203.0.113.0/24", "rrc01", &["1299", "64500"]).at(later);
        assert!(apply_announce(&mut s, &dup, false).is_none());
        assert_eq!(s.visible_by.len(), 1);
        assert_eq!(s.last_update, later);
        assert_eq!(s.last_path.as_deref(), Some("1299 64500"));
    }

    #[test]
    fn test_withdraw_keeps_stored_origin() {
        let mut s = PrefixState::new("203.0.113.0/24", Utc::now());
        apply_announce(&mut s, &announce("rrc01"), true);
        apply_withdraw(&mut s, &RouteUpdate::withdraw("203.0.113.0/24", "rrc01"), false);
        assert_eq!(s.origin_id.as_deref(), Some("64500"));
    }
}
