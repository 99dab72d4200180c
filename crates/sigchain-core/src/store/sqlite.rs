//! `SQLite`-backed implementation of [`LocalStore`].
//!
//! Uses WAL mode for concurrent reads while a load persists links.
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio_util::sync::CancellationToken;

use super::{DbKey, LocalStore, StoreError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The default `SQLite`-backed store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a store at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn now_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, cancel: &CancellationToken, key: &DbKey) -> Result<Option<Vec<u8>>, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE tbl = ?1 AND key = ?2",
                params![key.table.tag(), key.key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, cancel: &CancellationToken, key: &DbKey, value: &[u8]) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO kv (tbl, key, value, updated_at_ns) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tbl, key) DO UPDATE
                SET value = excluded.value, updated_at_ns = excluded.updated_at_ns",
            params![key.table.tag(), key.key, value, Self::now_ns()],
        )?;
        Ok(())
    }
}
