//! Local persistent storage for chains.
//!
//! The core persists two things: the tail triple for a user's chain and
//! the wire record of every link, both as opaque bytes under a typed key.
//! The [`LocalStore`] trait is the seam; [`SqliteStore`] is the default
//! implementation. Values must round-trip byte-exact.

mod sqlite;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use sqlite::SqliteStore;

/// Errors raised by local storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes failed to parse back into their expected shape.
    #[error("corrupt record under {key}: {reason}")]
    Corrupt {
        /// Text form of the offending key.
        key: String,
        /// Parse failure description.
        reason: String,
    },

    /// The operation was cancelled before completing.
    #[error("storage operation cancelled")]
    Cancelled,
}

/// Table tag for a typed storage key.
///
/// Tags are part of the persisted format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbTable {
    /// Tail triple of a user's public chain, keyed by uid.
    SigChainTailPublic,

    /// Wire record of one link, keyed by link id.
    Link,
}

impl DbTable {
    /// The stable numeric tag.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::SigChainTailPublic => 0x10,
            Self::Link => 0x02,
        }
    }
}

/// A typed storage key: table tag plus an identifier string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    /// Which table the key addresses.
    pub table: DbTable,

    /// Identifier within the table (uid or link id, lowercase hex).
    pub key: String,
}

impl DbKey {
    /// Builds a key.
    #[must_use]
    pub const fn new(table: DbTable, key: String) -> Self {
        Self { table, key }
    }
}

impl std::fmt::Display for DbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}:{}", self.table.tag(), self.key)
    }
}

/// Byte-oriented key-value storage.
///
/// Implementations must be safe to share across threads; the chain layer
/// serializes writers itself.
pub trait LocalStore: Send + Sync {
    /// Reads the value under `key`, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] when `cancel` has fired, or a
    /// backend error.
    fn get(&self, cancel: &CancellationToken, key: &DbKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] when `cancel` has fired, or a
    /// backend error.
    fn put(&self, cancel: &CancellationToken, key: &DbKey, value: &[u8]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_tags_are_stable() {
        // Persisted format; changing these breaks existing databases.
        assert_eq!(DbTable::SigChainTailPublic.tag(), 0x10);
        assert_eq!(DbTable::Link.tag(), 0x02);
    }

    #[test]
    fn db_key_display_is_tagged() {
        let key = DbKey::new(DbTable::Link, "abcd".to_string());
        assert_eq!(key.to_string(), "0x02:abcd");
    }
}
