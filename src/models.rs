use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Origin recorded when a route path carries no usable identifier
pub const UNKNOWN_ORIGIN: &str = "0";

/// Announcement vs. withdrawal discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Announce,
    Withdraw,
}

impl UpdateKind {
    pub fn as_str(&self) -> &str {
        match self {
            UpdateKind::Announce => "announce",
            UpdateKind::Withdraw => "withdraw",
        }
    }
}

/// A decoded route update as delivered by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub prefix: String,
    pub vantage_point: String,
    pub kind: UpdateKind,
    /// Origin carried by the update itself; withdrawals normally have none.
    pub origin_id: Option<String>,
    /// Route path, last element is the origin.
    pub path: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl RouteUpdate {
    /// Announcement whose origin is taken from the last path element.
    pub fn announce(prefix: &str, vantage_point: &str, path: &[&str]) -> Self {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        Self {
            prefix: prefix.to_string(),
            vantage_point: vantage_point.to_string(),
            kind: UpdateKind::Announce,
            origin_id: path.last().cloned(),
            path,
            observed_at: Utc::now(),
        }
    }

    pub fn withdraw(prefix: &str, vantage_point: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            vantage_point: vantage_point.to_string(),
            kind: UpdateKind::Withdraw,
            origin_id: None,
            path: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Space-joined path, `None` when the update carries no path
    pub fn path_string(&self) -> Option<String> {
        if self.path.is_empty() {
            None
        } else {
            Some(self.path.join(" "))
        }
    }
}

/// Reachability state of one prefix across vantage points.
///
/// Whether the prefix is down is derived from `visible_by` on every read and
/// is never serialized, so a stored record cannot disagree with itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixState {
    pub prefix: String,
    #[serde(default)]
    pub visible_by: BTreeSet<String>,
    /// Vantage points that withdrew since the last recovery.
    #[serde(default)]
    pub withdrawn_by: BTreeSet<String>,
    #[serde(default)]
    pub origin_id: Option<String>,
    #[serde(default)]
    pub last_path: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl PrefixState {
    pub fn new(prefix: &str, now: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.to_string(),
            visible_by: BTreeSet::new(),
            withdrawn_by: BTreeSet::new(),
            origin_id: None,
            last_path: None,
            last_update: now,
        }
    }

    #[inline]
    pub fn is_down(&self) -> bool {
        self.visible_by.is_empty()
    }

    pub fn origin_or_unknown(&self) -> String {
        self.origin_id
            .clone()
            .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutageEventKind {
    OutageStarted,
    RecoveryDetected,
}

impl OutageEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            OutageEventKind::OutageStarted => "outage_started",
            OutageEventKind::RecoveryDetected => "recovery_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outage_started" => Some(OutageEventKind::OutageStarted),
            "recovery_detected" => Some(OutageEventKind::RecoveryDetected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutageEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prefix-level transition, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutageEvent {
    pub id: String,
    pub prefix: String,
    pub origin_id: String,
    pub kind: OutageEventKind,
    pub timestamp: DateTime<Utc>,
    pub last_path: Option<String>,
    /// Snapshot of the withdrawing vantage points at the transition.
    pub withdrawn_by: Vec<String>,
    /// Set on recoveries only.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl OutageEvent {
    pub fn outage_started(state: &PrefixState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prefix: state.prefix.clone(),
            origin_id: state.origin_or_unknown(),
            kind: OutageEventKind::OutageStarted,
            timestamp: state.last_update,
            last_path: state.last_path.clone(),
            withdrawn_by: state.withdrawn_by.iter().cloned().collect(),
            resolved_at: None,
        }
    }

    pub fn recovery_detected(state: &PrefixState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prefix: state.prefix.clone(),
            origin_id: state.origin_or_unknown(),
            kind: OutageEventKind::RecoveryDetected,
            timestamp: state.last_update,
            last_path: state.last_path.clone(),
            withdrawn_by: state.withdrawn_by.iter().cloned().collect(),
            resolved_at: Some(state.last_update),
        }
    }
}

/// How an origin outage window was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    /// Every affected prefix recovered.
    Drained,
    /// Idle sweep closed it with prefixes possibly still down.
    TimedOut,
}

impl ClosureReason {
    pub fn as_str(&self) -> &str {
        match self {
            ClosureReason::Drained => "drained",
            ClosureReason::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drained" => Some(ClosureReason::Drained),
            "timed_out" => Some(ClosureReason::TimedOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Descriptive metadata for an origin network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginMeta {
    pub name: String,
    pub region: String,
    pub coordinates: Option<Coordinates>,
}

impl OriginMeta {
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            region: "Unknown".to_string(),
            coordinates: None,
        }
    }
}

/// Closed origin-level outage window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginOutage {
    pub id: String,
    pub origin_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
    /// Every prefix that went down while the window was open.
    pub affected_prefixes: Vec<String>,
    /// Prefixes still down at closure; empty for drained windows.
    pub unresolved_prefixes: Vec<String>,
    /// 0-100, share of the origin's known prefixes affected.
    pub severity: u8,
    pub closure: ClosureReason,
    pub origin_name: String,
    pub region: String,
    pub coordinates: Option<Coordinates>,
}

impl OriginOutage {
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs)
    }
}

/// Subscription request for the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub prefixes: Vec<String>,
    pub more_specific: bool,
}

impl SubscriptionSpec {
    pub fn new(prefixes: Vec<String>, more_specific: bool) -> Self {
        Self {
            prefixes,
            more_specific,
        }
    }
}

/// A prefix registered for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPrefix {
    pub prefix: String,
    pub description: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Aggregate figures over the event store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutageStats {
    pub total_outages: u64,
    pub total_recoveries: u64,
    pub active_outages: u64,
    pub unique_origins: u64,
    pub unique_prefixes: u64,
    pub origin_outages: u64,
    pub avg_origin_outage_minutes: f64,
    pub outages_last_24h: u64,
    pub outages_last_7d: u64,
}
