//! SQLite-backed persistence for the resource table.
//!
//! One row per entity group, holding its JSON [`GroupRecord`], plus one row
//! per installed digest. The whole table is rewritten in a single transaction
//! on every save.

use std::path::Path;

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, warn};

use crate::table::{GroupRecord, PersistentResourceTable};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported record version {version} for {key}")]
    UnsupportedVersion { key: String, version: u32 },

    #[error("corrupt record for {key}: {reason}")]
    CorruptRecord { key: String, reason: String },
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entity_groups (
                entity_id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS installed_digests (
                entity_id TEXT PRIMARY KEY,
                digest TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Load the persisted resource table.
    ///
    /// Any unreadable record fails the whole load.
    pub fn load_table(&self) -> Result<PersistentResourceTable, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, record FROM entity_groups ORDER BY entity_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let groups = rows
            .iter()
            .map(|(key, raw)| GroupRecord::decode(key, raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, digest FROM installed_digests")?;
        let digests = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let table = PersistentResourceTable::from_groups(groups).with_installed_digests(digests);
        debug!(
            groups = table.len(),
            resources = table.resource_count(),
            "Loaded resource table"
        );
        Ok(table)
    }

    /// Replace the persisted table with `table`.
    pub fn save_table(&mut self, table: &PersistentResourceTable) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entity_groups", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO entity_groups (entity_id, record, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (entity_id, record) in table.records() {
                insert.execute(params![entity_id, record.encode()?, now])?;
            }
        }
        tx.execute("DELETE FROM installed_digests", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO installed_digests (entity_id, digest, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (entity_id, digest) in table.installed_digests() {
                insert.execute(params![entity_id, digest, now])?;
            }
        }
        tx.commit()?;

        debug!(groups = table.len(), "Persisted resource table");
        Ok(())
    }

    /// Load the table, falling back to an empty one if it cannot be read.
    pub fn load_or_empty(&self) -> PersistentResourceTable {
        match self.load_table() {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Unable to restore resource table, starting empty");
                PersistentResourceTable::new()
            }
        }
    }

    /// Number of persisted groups.
    pub fn group_count(&self) -> Result<i64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entity_groups", [], |row| row.get(0))?;
        Ok(count)
    }

    #[cfg(test)]
    fn put_raw(&self, entity_id: &str, record: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entity_groups (entity_id, record, updated_at) VALUES (?1, ?2, 0)",
            params![entity_id, record],
        )?;
        Ok(())
    }
}
