//! Durable event storage
//!
//! Append-only record of prefix transitions and closed origin outages, plus
//! the monitored-prefix registry. The read-side queries here are the data
//! source for any query surface layered on top.
//!
//! - WAL mode for concurrent reads during writes
//! - Prepared statement caching
//! - Appends are `INSERT OR IGNORE` keyed by event id, so a re-delivered
//!   identical event is tolerated

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use crate::models::{
    ClosureReason, Coordinates, MonitoredPrefix, OriginOutage, OutageEvent, OutageEventKind,
    OutageStats,
};

/// Consumer of finished and ongoing events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append_event(&self, event: &OutageEvent) -> Result<()>;
    async fn append_origin_outage(&self, outage: &OriginOutage) -> Result<()>;
    /// Distinct prefixes ever recorded under `origin_id`; `None` when unknown
    async fn known_prefix_count(&self, origin_id: &str) -> Result<Option<u64>>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS outage_events (
    id TEXT PRIMARY KEY,
    prefix TEXT NOT NULL,
    origin_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    last_path TEXT,
    withdrawn_by_json TEXT NOT NULL,
    resolved_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_outage_events_recent
    ON outage_events(timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_outage_events_prefix
    ON outage_events(prefix, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_outage_events_origin
    ON outage_events(origin_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS origin_outages (
    id TEXT PRIMARY KEY,
    origin_id TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL,
    affected_json TEXT NOT NULL,
    unresolved_json TEXT NOT NULL,
    severity INTEGER NOT NULL,
    closure TEXT NOT NULL,
    origin_name TEXT NOT NULL,
    region TEXT NOT NULL,
    latitude REAL,
    longitude REAL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_origin_outages_origin
    ON origin_outages(origin_id, start_time DESC);

CREATE INDEX IF NOT EXISTS idx_origin_outages_start
    ON origin_outages(start_time DESC);

CREATE TABLE IF NOT EXISTS monitored_prefixes (
    prefix TEXT PRIMARY KEY,
    description TEXT,
    added_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

const EVENT_COLUMNS: &str =
    "id, prefix, origin_id, kind, timestamp, last_path, withdrawn_by_json, resolved_at";

const ORIGIN_OUTAGE_COLUMNS: &str = "id, origin_id, start_time, end_time, duration_secs, \
     affected_json, unresolved_json, severity, closure, origin_name, region, latitude, longitude";

/// Value in a row that does not map back onto a model type
#[derive(Debug)]
struct StoredValueError(String);

impl std::fmt::Display for StoredValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized stored value: {}", self.0)
    }
}

impl std::error::Error for StoredValueError {}

fn conversion_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn ms_to_dt(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_err(StoredValueError(ms.to_string())))
}

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outage_events", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, events = count, "event_store_opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<OutageEvent> {
        let kind: String = row.get(3)?;
        let kind = OutageEventKind::parse(&kind)
            .ok_or_else(|| conversion_err(StoredValueError(kind.clone())))?;
        let withdrawn_json: String = row.get(6)?;
        let withdrawn_by = serde_json::from_str(&withdrawn_json).map_err(conversion_err)?;
        let resolved_at: Option<i64> = row.get(7)?;

        Ok(OutageEvent {
            id: row.get(0)?,
            prefix: row.get(1)?,
            origin_id: row.get(2)?,
            kind,
            timestamp: ms_to_dt(row.get(4)?)?,
            last_path: row.get(5)?,
            withdrawn_by,
            resolved_at: resolved_at.map(ms_to_dt).transpose()?,
        })
    }

    fn row_to_origin_outage(row: &rusqlite::Row) -> rusqlite::Result<OriginOutage> {
        let affected_json: String = row.get(5)?;
        let unresolved_json: String = row.get(6)?;
        let severity: i64 = row.get(7)?;
        let closure: String = row.get(8)?;
        let closure = ClosureReason::parse(&closure)
            .ok_or_else(|| conversion_err(StoredValueError(closure.clone())))?;
        let latitude: Option<f64> = row.get(11)?;
        let longitude: Option<f64> = row.get(12)?;

        Ok(OriginOutage {
            id: row.get(0)?,
            origin_id: row.get(1)?,
            start_time: ms_to_dt(row.get(2)?)?,
            end_time: ms_to_dt(row.get(3)?)?,
            duration_secs: row.get(4)?,
            affected_prefixes: serde_json::from_str(&affected_json).map_err(conversion_err)?,
            unresolved_prefixes: serde_json::from_str(&unresolved_json).map_err(conversion_err)?,
            severity: severity.clamp(0, 100) as u8,
            closure,
            origin_name: row.get(9)?,
            region: row.get(10)?,
            coordinates: match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => Some(Coordinates {
                    latitude,
                    longitude,
                }),
                _ => None,
            },
        })
    }

    fn query_events(&self, sql_tail: &str, params: impl rusqlite::Params) -> Result<Vec<OutageEvent>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM outage_events {}", EVENT_COLUMNS, sql_tail);
        let mut stmt = conn.prepare_cached(&sql)?;
        let events = stmt
            .query_map(params, Self::row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    fn query_origin_outages(
        &self,
        sql_tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<OriginOutage>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM origin_outages {}",
            ORIGIN_OUTAGE_COLUMNS, sql_tail
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let outages = stmt
            .query_map(params, Self::row_to_origin_outage)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(outages)
    }

    /// Most recent events of either kind
    pub fn recent_events(&self, limit: usize) -> Result<Vec<OutageEvent>> {
        self.query_events(
            "ORDER BY timestamp DESC, id LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Outage starts with no recovery recorded at or after them
    pub fn active_outages(&self) -> Result<Vec<OutageEvent>> {
        self.query_events(
            "AS e WHERE e.kind = 'outage_started' AND NOT EXISTS ( \
                 SELECT 1 FROM outage_events r \
                 WHERE r.prefix = e.prefix AND r.kind = 'recovery_detected' \
                 AND r.timestamp >= e.timestamp) \
             ORDER BY e.timestamp DESC",
            [],
        )
    }

    pub fn prefix_history(&self, prefix: &str, limit: usize) -> Result<Vec<OutageEvent>> {
        self.query_events(
            "WHERE prefix = ?1 ORDER BY timestamp DESC LIMIT ?2",
            params![prefix, limit as i64],
        )
    }

    pub fn origin_events(&self, origin_id: &str, limit: usize) -> Result<Vec<OutageEvent>> {
        self.query_events(
            "WHERE origin_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            params![origin_id, limit as i64],
        )
    }

    /// Closed windows for one origin, newest first
    pub fn origin_outages(&self, origin_id: &str, limit: usize) -> Result<Vec<OriginOutage>> {
        self.query_origin_outages(
            "WHERE origin_id = ?1 ORDER BY start_time DESC LIMIT ?2",
            params![origin_id, limit as i64],
        )
    }

    /// Closed windows that started at or after `since`
    pub fn recent_origin_outages(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OriginOutage>> {
        self.query_origin_outages(
            "WHERE start_time >= ?1 ORDER BY start_time DESC LIMIT ?2",
            params![since.timestamp_millis(), limit as i64],
        )
    }

    pub fn stats(&self) -> Result<OutageStats> {
        let now = Utc::now();
        let day_ago = (now - chrono::Duration::hours(24)).timestamp_millis();
        let week_ago = (now - chrono::Duration::days(7)).timestamp_millis();
        let active = self.active_outages()?.len() as u64;

        let conn = self.conn.lock();
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<u64> {
            let n: i64 = conn.query_row(sql, p, |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        let total_outages = count(
            "SELECT COUNT(*) FROM outage_events WHERE kind = 'outage_started'",
            &[],
        )?;
        let total_recoveries = count(
            "SELECT COUNT(*) FROM outage_events WHERE kind = 'recovery_detected'",
            &[],
        )?;
        let unique_origins = count("SELECT COUNT(DISTINCT origin_id) FROM outage_events", &[])?;
        let unique_prefixes = count("SELECT COUNT(DISTINCT prefix) FROM outage_events", &[])?;
        let origin_outages = count("SELECT COUNT(*) FROM origin_outages", &[])?;
        let outages_last_24h = count(
            "SELECT COUNT(*) FROM outage_events WHERE kind = 'outage_started' AND timestamp >= ?1",
            &[&day_ago],
        )?;
        let outages_last_7d = count(
            "SELECT COUNT(*) FROM outage_events WHERE kind = 'outage_started' AND timestamp >= ?1",
            &[&week_ago],
        )?;
        let avg_secs: f64 = conn.query_row(
            "SELECT COALESCE(AVG(duration_secs), 0.0) FROM origin_outages",
            [],
            |row| row.get(0),
        )?;

        Ok(OutageStats {
            total_outages,
            total_recoveries,
            active_outages: active,
            unique_origins,
            unique_prefixes,
            origin_outages,
            avg_origin_outage_minutes: avg_secs / 60.0,
            outages_last_24h,
            outages_last_7d,
        })
    }

    // ---------------------------------------------------------------------
    // Monitored prefix registry
    // ---------------------------------------------------------------------

    /// Returns false when the prefix was already registered
    pub fn add_monitored_prefix(&self, prefix: &str, description: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO monitored_prefixes (prefix, description, added_at) VALUES (?1, ?2, ?3)",
            params![prefix, description, Utc::now().timestamp_millis()],
        )?;
        Ok(changes > 0)
    }

    pub fn remove_monitored_prefix(&self, prefix: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "DELETE FROM monitored_prefixes WHERE prefix = ?1",
            params![prefix],
        )?;
        Ok(changes > 0)
    }

    pub fn list_monitored_prefixes(&self) -> Result<Vec<MonitoredPrefix>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT prefix, description, added_at FROM monitored_prefixes ORDER BY added_at, prefix",
        )?;
        let prefixes = stmt
            .query_map([], |row| {
                Ok(MonitoredPrefix {
                    prefix: row.get(0)?,
                    description: row.get(1)?,
                    added_at: ms_to_dt(row.get(2)?)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(prefixes)
    }
}

#[async_trait]
impl EventSink for SqliteEventStore {
    async fn append_event(&self, event: &OutageEvent) -> Result<()> {
        let withdrawn_json = serde_json::to_string(&event.withdrawn_by)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO outage_events \
             (id, prefix, origin_id, kind, timestamp, last_path, withdrawn_by_json, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &event.id,
                &event.prefix,
                &event.origin_id,
                event.kind.as_str(),
                event.timestamp.timestamp_millis(),
                &event.last_path,
                &withdrawn_json,
                event.resolved_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    async fn append_origin_outage(&self, outage: &OriginOutage) -> Result<()> {
        let affected_json = serde_json::to_string(&outage.affected_prefixes)?;
        let unresolved_json = serde_json::to_string(&outage.unresolved_prefixes)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO origin_outages \
             (id, origin_id, start_time, end_time, duration_secs, affected_json, unresolved_json, \
              severity, closure, origin_name, region, latitude, longitude) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &outage.id,
                &outage.origin_id,
                outage.start_time.timestamp_millis(),
                outage.end_time.timestamp_millis(),
                outage.duration_secs,
                &affected_json,
                &unresolved_json,
                outage.severity as i64,
                outage.closure.as_str(),
                &outage.origin_name,
                &outage.region,
                outage.coordinates.map(|c| c.latitude),
                outage.coordinates.map(|c| c.longitude),
            ],
        )?;
        Ok(())
    }

    async fn known_prefix_count(&self, origin_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT prefix) FROM outage_events WHERE origin_id = ?1",
            params![origin_id],
            |row| row.get(0),
        )?;
        Ok(if n > 0 { Some(n as u64) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(prefix: &str, origin: &str, kind: OutageEventKind, at: DateTime<Utc>) -> OutageEvent {
        OutageEvent {
            id: uuid::Uuid::new_v4().to_string(),
            prefix: prefix.to_string(),
            origin_id: origin.to_string(),
            kind,
            timestamp: at,
            last_path: Some("3333 64500".to_string()),
            withdrawn_by: vec!["rrc01".to_string(), "rrc02".to_string()],
            resolved_at: match kind {
                OutageEventKind::RecoveryDetected => Some(at),
                OutageEventKind::OutageStarted => None,
            },
        }
    }

    fn origin_outage(origin: &str, start: DateTime<Utc>, secs: i64) -> OriginOutage {
        OriginOutage {
            id: uuid::Uuid::new_v4().to_string(),
            origin_id: origin.to_string(),
            start_time: start,
            end_time: start + chrono::Duration::seconds(secs),
            duration_secs: secs,
            affected_prefixes: vec!["203.0.113.0/24".to_string()],
            unresolved_prefixes: vec![],
            severity: 50,
            closure: ClosureReason::Drained,
            origin_name: "Example Net".to_string(),
            region: "NL".to_string(),
            coordinates: Some(Coordinates {
                latitude: 52.37,
                longitude: 4.89,
            }),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        let e = event("203.0.113.0/24", "64500", OutageEventKind::OutageStarted, Utc::now());
        store.append_event(&e).await.unwrap();

        let recent = store.recent_events(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, e.id);
        assert_eq!(recent[0].withdrawn_by, vec!["rrc01", "rrc02"]);
        assert_eq!(recent[0].timestamp.timestamp_millis(), e.timestamp.timestamp_millis());
    }

    #[tokio::test]
    async fn test_duplicate_append_tolerated() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        let e = event("203.0.113.0/24", "64500", OutageEventKind::OutageStarted, Utc::now());
        store.append_event(&e).await.unwrap();
        store.append_event(&e).await.unwrap();
        assert_eq!(store.recent_events(10).unwrap().len(), 1);

        let o = origin_outage("64500", Utc::now(), 60);
        store.append_origin_outage(&o).await.unwrap();
        store.append_origin_outage(&o).await.unwrap();
        assert_eq!(store.origin_outages("64500", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_outages_excludes_recovered() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = t0 + chrono::Duration::minutes(2);

        store
            .append_event(&event("203.0.113.0/24", "64500", OutageEventKind::OutageStarted, t0))
            .await
            .unwrap();
        store
            .append_event(&event("198.51.100.0/24", "64500", OutageEventKind::OutageStarted, t0))
            .await
            .unwrap();
        store
            .append_event(&event("203.0.113.0/24", "64500", OutageEventKind::RecoveryDetected, t1))
            .await
            .unwrap();

        let active = store.active_outages().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].prefix, "198.51.100.0/24");

        let history = store.prefix_history("203.0.113.0/24", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, OutageEventKind::RecoveryDetected);
        assert!(history[0].resolved_at.is_some());

        assert_eq!(store.origin_events("64500", 10).unwrap().len(), 3);
        assert_eq!(store.known_prefix_count("64500").await.unwrap(), Some(2));
        assert_eq!(store.known_prefix_count("64501").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_origin_outage_round_trip() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        let mut o = origin_outage("64500", Utc::now() - chrono::Duration::hours(1), 300);
        o.closure = ClosureReason::TimedOut;
        o.unresolved_prefixes = vec!["203.0.113.0/24".to_string()];
        store.append_origin_outage(&o).await.unwrap();

        let loaded = store.origin_outages("64500", 5).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].closure, ClosureReason::TimedOut);
        assert_eq!(loaded[0].unresolved_prefixes, vec!["203.0.113.0/24"]);
        assert_eq!(loaded[0].coordinates.map(|c| c.latitude), Some(52.37));

        let since = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(store.recent_origin_outages(since, 10).unwrap().len(), 1);
        let later = Utc::now();
        assert!(store.recent_origin_outages(later, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        let now = Utc::now();
        let old = now - chrono::Duration::days(3);

        store
            .append_event(&event("203.0.113.0/24", "64500", OutageEventKind::OutageStarted, now))
            .await
            .unwrap();
        store
            .append_event(&event("198.51.100.0/24", "64501", OutageEventKind::OutageStarted, old))
            .await
            .unwrap();
        store
            .append_event(&event(
                "198.51.100.0/24",
                "64501",
                OutageEventKind::RecoveryDetected,
                old + chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();
        store
            .append_origin_outage(&origin_outage("64501", old, 300))
            .await
            .unwrap();
        store
            .append_origin_outage(&origin_outage("64500", now, 900))
            .await
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_outages, 2);
        assert_eq!(stats.total_recoveries, 1);
        assert_eq!(stats.active_outages, 1);
        assert_eq!(stats.unique_origins, 2);
        assert_eq!(stats.unique_prefixes, 2);
        assert_eq!(stats.origin_outages, 2);
        assert!((stats.avg_origin_outage_minutes - 10.0).abs() < 1e-9);
        assert_eq!(stats.outages_last_24h, 1);
        assert_eq!(stats.outages_last_7d, 2);
    }

    #[tokio::test]
    async fn test_monitored_prefix_registry() {
        let store = SqliteEventStore::new(":memory:").expect("Failed to create database");
        assert!(store.add_monitored_prefix("203.0.113.0/24", Some("lab")).unwrap());
        assert!(!store.add_monitored_prefix("203.0.113.0/24", None).unwrap());
        assert!(store.add_monitored_prefix("198.51.100.0/24", None).unwrap());

        let listed = store.list_monitored_prefixes().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .any(|p| p.prefix == "203.0.113.0/24" && p.description.as_deref() == Some("lab")));

        assert!(store.remove_monitored_prefix("203.0.113.0/24").unwrap());
        assert!(!store.remove_monitored_prefix("203.0.113.0/24").unwrap());
        assert_eq!(store.list_monitored_prefixes().unwrap().len(), 1);
    }
}
