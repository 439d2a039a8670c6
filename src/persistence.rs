//! Database persistence layer for the VSportChain node
//!
//! The node keeps everything in a flat key/value space: the SQLite-backed
//! [`Database`] for real runs and [`MemoryDatabase`] for tests and ephemeral
//! nodes. Typed accessors on top of this live in [`crate::rawdb`].

use crate::error::ChainError;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Abstraction for key/value persistence backends shared by every subsystem
/// that touches the chain database.
pub trait ChainDb: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError>;
    fn delete(&self, key: &[u8]) -> Result<(), ChainError>;

    fn has(&self, key: &[u8]) -> Result<bool, ChainError> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies all writes atomically.
    fn write_batch(&self, batch: Batch) -> Result<(), ChainError>;

    /// Releases the underlying handle. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A set of writes applied together by [`ChainDb::write_batch`].
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push((key.to_vec(), Some(value.to_vec())));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push((key.to_vec(), None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn closed_error() -> ChainError {
    ChainError::DatabaseError("database is closed".to_string())
}

pub struct Database {
    conn: Mutex<Option<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        info!("Opened chain database at {}", path.display());
        Ok(Database {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Opens a private in-process SQLite database.
    pub fn open_in_memory() -> Result<Self, ChainError> {
        Self::open(":memory:")
    }
}

impl ChainDb for Database {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed_error)?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read key: {}", e)))?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed_error)?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to write key: {}", e)))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed_error)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to delete key: {}", e)))?;
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<(), ChainError> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or_else(closed_error)?;
        let tx = conn.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        for (key, value) in &batch.ops {
            match value {
                Some(value) => tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, value],
                ),
                None => tx.execute("DELETE FROM kv WHERE key = ?1", params![key]),
            }
            .map_err(|e| ChainError::DatabaseError(format!("Failed to apply batch: {}", e)))?;
        }

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close chain database cleanly: {}", e);
            }
            debug!("Chain database closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}

/// Simple in-memory key/value store useful for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryDatabase {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        Ok(())
    }
}

impl ChainDb for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.ensure_open()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.ensure_open()?;
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        self.ensure_open()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: Batch) -> Result<(), ChainError> {
        self.ensure_open()?;
        let mut entries = self.entries.write();
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_put_get_delete() {
        let db = Database::open_in_memory().unwrap();
        db.put(b"k", b"v1").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v1".to_vec()));
        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
        db.delete(b"k").unwrap();
        assert!(!db.has(b"k").unwrap());
    }

    #[test]
    fn test_batch_is_applied_atomically() {
        let db = Database::open_in_memory().unwrap();
        db.put(b"gone", b"x").unwrap();

        let mut batch = Batch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"gone");
        db.write_batch(batch).unwrap();

        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_database_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chaindata.sqlite");
        {
            let db = Database::open(&path).unwrap();
            db.put(b"version", &[3]).unwrap();
            db.close();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"version").unwrap(), Some(vec![3]));
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let db = Database::open_in_memory().unwrap();
        db.close();
        db.close();
        assert!(db.is_closed());
        assert!(db.get(b"k").is_err());

        let mem = MemoryDatabase::new();
        mem.put(b"k", b"v").unwrap();
        mem.close();
        assert!(mem.is_closed());
        assert!(mem.put(b"k", b"v").is_err());
    }
}
