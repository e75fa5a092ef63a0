use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Payment failure records
pub const FAILURE_PREFIX: &str = "f_";
/// Payment success records
pub const SUCCESS_PREFIX: &str = "s_";
/// Routes dispatched for a payment hash
pub const ROUTE_PREFIX: &str = "r_";
/// Payments whose outcome was unknown when we stopped waiting
pub const TIMEOUT_PREFIX: &str = "timeout_";

/// Every record expires two weeks after it was last written.
pub const RECORD_TTL_SECS: i64 = 14 * 24 * 60 * 60;

/// Expiring key/value store for preimages and payment records.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store connection lock poisoned"))
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn set_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn()?.execute(
            "INSERT INTO records (key, value, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                created_at = excluded.created_at, expires_at = excluded.expires_at",
            params![key, value, now, now + RECORD_TTL_SECS],
        )?;
        Ok(())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json)
    }

    pub fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = chrono::Utc::now().timestamp();
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM records WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get_raw(key)? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).with_context(|| format!("corrupt record {}", key))?,
            )),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// All live records under `prefix`, oldest first. Undecodable records are skipped.
    pub fn list_prefix<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<(String, T)>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM records
             WHERE substr(key, 1, ?1) = ?2 AND expires_at > ?3
             ORDER BY created_at, key",
        )?;
        let rows = stmt.query_map(params![prefix.len() as i64, prefix, now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, json) = row?;
            match serde_json::from_str(&json) {
                Ok(value) => out.push((key, value)),
                Err(e) => log::warn!("Store: skipping undecodable record {}: {}", key, e),
            }
        }
        Ok(out)
    }

    pub fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let n = self.conn()?.execute(
            "DELETE FROM records WHERE substr(key, 1, ?1) = ?2",
            params![prefix.len() as i64, prefix],
        )?;
        Ok(n)
    }

    pub fn purge_expired(&self) -> anyhow::Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let n = self
            .conn()?
            .execute("DELETE FROM records WHERE expires_at <= ?1", params![now])?;
        Ok(n)
    }

    #[cfg(test)]
    fn expire_now(&self, key: &str) -> anyhow::Result<()> {
        self.conn()?.execute(
            "UPDATE records SET expires_at = 0 WHERE key = ?1",
            params![key],
        )?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- Preimages (keyed by bare payment hash) and prefixed payment records
CREATE TABLE IF NOT EXISTS records (
    key TEXT NOT NULL PRIMARY KEY,
    value TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_expiry
    ON records(expires_at);
"#;
