//! SQLite-backed shared key-value store
//!
//! Entries carry an absolute `expires_at` (unix ms). Reads filter expired rows
//! and `purge_expired` deletes them, on open and on every maintenance tick;
//! the TTL is enforced here regardless of what any process-local cache still
//! holds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use super::state_store::{KvBackend, KvEntry};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS shared_state (
    state_key TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    expires_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_shared_state_expires_at
    ON shared_state(expires_at);
"#;

pub struct SqliteKvBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvBackend {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open state store at {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize state store schema")?;

        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let purged = backend.delete_expired_rows()?;
        info!(path = db_path, purged, "state_store_opened");
        Ok(backend)
    }

    fn delete_expired_rows(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM shared_state WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        if deleted > 0 {
            debug!(deleted, "state_store_purged");
        }
        Ok(deleted)
    }

    fn row_to_entry(json: String, expires_at_ms: i64) -> Result<KvEntry> {
        let expires_at = Utc
            .timestamp_millis_opt(expires_at_ms)
            .single()
            .context("Invalid expires_at in shared_state")?;
        Ok(KvEntry {
            value: json,
            expires_at,
        })
    }
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT state_json, expires_at FROM shared_state WHERE state_key = ?1 AND expires_at > ?2",
        )?;
        let row: Option<(String, i64)> = stmt
            .query_row(params![key, Utc::now().timestamp_millis()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        row.map(|(json, exp)| Self::row_to_entry(json, exp))
            .transpose()
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shared_state (state_key, state_json, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(state_key) DO UPDATE SET state_json=excluded.state_json, expires_at=excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM shared_state WHERE state_key = ?1",
            params![key],
        )?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT state_key, state_json, expires_at FROM shared_state \
             WHERE substr(state_key, 1, length(?1)) = ?1 AND expires_at > ?2",
        )?;
        let rows: Vec<(String, String, i64)> = stmt
            .query_map(params![prefix, Utc::now().timestamp_millis()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        rows.into_iter()
            .map(|(key, json, exp)| Ok((key, Self::row_to_entry(json, exp)?)))
            .collect()
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.delete_expired_rows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let kv = SqliteKvBackend::new(":memory:").expect("Failed to create store");
        kv.put("prefix:203.0.113.0/24", "{\"a\":1}", Duration::from_secs(60))
            .await
            .unwrap();

        let entry = kv.get("prefix:203.0.113.0/24").await.unwrap().unwrap();
        assert_eq!(entry.value, "{\"a\":1}");
        assert!(entry.expires_at > Utc::now());

        kv.delete("prefix:203.0.113.0/24").await.unwrap();
        assert!(kv.get("prefix:203.0.113.0/24").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_rows_hidden_and_purged() {
        let kv = SqliteKvBackend::new(":memory:").expect("Failed to create store");
        kv.put("prefix:a", "1", Duration::from_millis(1)).await.unwrap();
        kv.put("prefix:b", "2", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(kv.get("prefix:a").await.unwrap().is_none());
        let live = kv.scan_prefix("prefix:").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, "prefix:b");

        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert_eq!(kv.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_respects_key_prefix() {
        let kv = SqliteKvBackend::new(":memory:").expect("Failed to create store");
        kv.put("prefix:a", "1", Duration::from_secs(60)).await.unwrap();
        kv.put("origin:64500", "2", Duration::from_secs(60)).await.unwrap();
        let live = kv.scan_prefix("prefix:").await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let path = path.to_str().unwrap();
        {
            let kv = SqliteKvBackend::new(path).unwrap();
            kv.put("prefix:a", "1", Duration::from_secs(60)).await.unwrap();
        }
        let kv = SqliteKvBackend::new(path).unwrap();
        assert_eq!(kv.get("prefix:a").await.unwrap().unwrap().value, "1");
    }
}
