use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{next_record_id, MemoryRecord, MemoryStore};
use crate::error::AgentError;

/// Memory records in a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_records (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                record_type TEXT NOT NULL,
                summary TEXT NOT NULL
            )"#,
            [],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl MemoryStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, record_type, summary
             FROM memory_records
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, timestamp, record_type, summary) in rows.into_iter().rev() {
            match DateTime::parse_from_rfc3339(&timestamp) {
                Ok(parsed) => records.push(MemoryRecord {
                    id,
                    timestamp: parsed.with_timezone(&Local),
                    record_type,
                    summary,
                }),
                Err(e) => {
                    let error = AgentError::MemoryStoreRead {
                        location: format!("memory_records#{}", id),
                        source: e.into(),
                    };
                    tracing::warn!("Skipping memory record: {}", error);
                }
            }
        }
        Ok(records)
    }

    fn persist(&self, summary: &str) -> Result<MemoryRecord> {
        let conn = self.lock_conn()?;
        let last: Option<i64> = conn
            .query_row("SELECT MAX(id) FROM memory_records", [], |row| row.get(0))
            .optional()?
            .flatten();

        let id = next_record_id(Utc::now().timestamp_millis(), last);
        let record = MemoryRecord::new(id, summary);
        conn.execute(
            "INSERT INTO memory_records (id, timestamp, record_type, summary)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.timestamp.to_rfc3339(),
                record.record_type,
                record.summary,
            ],
        )?;

        tracing::info!("Memory saved: memory_records#{}", record.id);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_has_no_records() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.recent(3).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn persist_then_recent_keeps_order_and_limit() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..4 {
            store.persist(&format!("session {}", i)).unwrap();
        }

        let recent = store.recent(3).unwrap();
        let summaries: Vec<&str> = recent.iter().map(|r| r.summary.as_str()).collect();
        assert_eq!(summaries, vec!["session 1", "session 2", "session 3"]);
        assert!(recent.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn bad_timestamps_are_skipped() {
        let store = SqliteStore::in_memory().unwrap();
        store.persist("kept").unwrap();
        store
            .lock_conn()
            .unwrap()
            .execute(
                "INSERT INTO memory_records (id, timestamp, record_type, summary)
                 VALUES (?1, 'yesterday-ish', 'Conversation Summary', 'lost')",
                [i64::MAX],
            )
            .unwrap();

        let recent = store.recent(3).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].summary, "kept");
    }

    #[test]
    fn database_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.persist("I remember this.").unwrap();
        }
        let reopened = SqliteStore::new(&path).unwrap();
        let recent = reopened.recent(3).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].summary, "I remember this.");
    }
}
