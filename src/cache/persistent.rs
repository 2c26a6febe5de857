//! Persistent cache tier backed by SQLite
//!
//! Bounded by entry count; when over the cap the oldest insertions are
//! evicted first. Rewriting a key counts as a fresh insertion.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Durable bottom tier of the result cache
pub trait PersistentTier: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn len(&self) -> Result<usize>;
}

pub struct SqliteTier {
    conn: Mutex<Connection>,
    max_entries: usize,
}

impl SqliteTier {
    /// Open or create the cache database
    pub fn open(path: &Path, max_entries: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let tier = Self::with_connection(conn, max_entries)?;
        info!("Persistent cache opened: {}", path.display());
        Ok(tier)
    }

    /// In-memory database, for tests and ephemeral deployments
    pub fn in_memory(max_entries: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, max_entries)
    }

    fn with_connection(conn: Connection, max_entries: usize) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL,
                stored_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries: max_entries.max(1),
        })
    }

    fn evict_overflow(&self, conn: &Connection) -> Result<()> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        let overflow = count - self.max_entries as i64;
        if overflow > 0 {
            conn.execute(
                "DELETE FROM cache_entries WHERE seq IN
                 (SELECT seq FROM cache_entries ORDER BY seq ASC LIMIT ?1)",
                params![overflow],
            )?;
            debug!("Evicted {} persistent cache entries", overflow);
        }
        Ok(())
    }
}

impl PersistentTier for SqliteTier {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match raw {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        })
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO cache_entries (key, value, stored_at) VALUES (?1, ?2, ?3)",
            params![key, text, chrono::Utc::now().to_rfc3339()],
        )?;
        self.evict_overflow(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM cache_entries", [])?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache").join("results.db");

        {
            let tier = SqliteTier::open(&path, 10).unwrap();
            tier.put("k", &json!({"rows": [1, 2]})).unwrap();
        }

        let tier = SqliteTier::open(&path, 10).unwrap();
        assert_eq!(tier.get("k").unwrap(), Some(json!({"rows": [1, 2]})));
        assert_eq!(tier.get("missing").unwrap(), None);
    }

    #[test]
    fn test_evicts_oldest_insertion() {
        let tier = SqliteTier::in_memory(2).unwrap();
        tier.put("a", &json!(1)).unwrap();
        tier.put("b", &json!(2)).unwrap();
        tier.put("a", &json!(10)).unwrap(); // rewrite moves "a" to the back
        tier.put("c", &json!(3)).unwrap();

        assert_eq!(tier.len().unwrap(), 2);
        assert_eq!(tier.get("b").unwrap(), None);
        assert_eq!(tier.get("a").unwrap(), Some(json!(10)));
        assert_eq!(tier.get("c").unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = SqliteTier::in_memory(10).unwrap();
        tier.put("a", &json!(1)).unwrap();
        tier.put("b", &json!(2)).unwrap();
        tier.remove("a").unwrap();
        assert_eq!(tier.len().unwrap(), 1);
        tier.clear().unwrap();
        assert_eq!(tier.len().unwrap(), 0);
    }

    #[test]
    fn test_failed_rewrite_keeps_previous_value() {
        let tier = SqliteTier::in_memory(10).unwrap();
        tier.put("k", &json!("good")).unwrap();
        tier.conn
            .lock()
            .execute_batch(
                r#"CREATE TRIGGER reject_bad BEFORE INSERT ON cache_entries
                   WHEN NEW.value = '"bad"'
                   BEGIN SELECT RAISE(ABORT, 'rejected'); END;"#,
            )
            .unwrap();

        assert!(tier.put("k", &json!("bad")).is_err());
        assert_eq!(tier.get("k").unwrap(), Some(json!("good")));
        assert_eq!(tier.len().unwrap(), 1);
    }
}
