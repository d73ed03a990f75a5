//! Key-value capability backing the session collection.
//!
//! Each key holds one opaque blob that is read and written whole.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use dashmap::DashMap;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::storage::errors::StoreResult;

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable blob storage keyed by string.
pub trait KeyValueStore: Send + Sync {
    /// Read the blob under `key`, if any.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, StoreResult<Option<Vec<u8>>>>;

    /// Replace the blob under `key`. A write is all-or-nothing.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, StoreResult<()>>;
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, StoreResult<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.entries.get(key).map(|entry| entry.value().clone())) })
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.entries.insert(key.to_string(), value);
            Ok(())
        })
    }
}

/// `SQLite` implementation of blob storage.
pub struct SqliteKvStore {
    conn: Connection,
    table: String,
}

impl SqliteKvStore {
    /// Table name for blobs.
    pub const DEFAULT_TABLE: &'static str = "kv_store";

    /// Open (or create) a database file and ensure the table exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path).await?;
        Self::with_connection(conn).await
    }

    /// In-memory database, gone when the store is dropped.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> StoreResult<Self> {
        let table = Self::DEFAULT_TABLE.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL
                );"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn read<'a>(&'a self, key: &'a str) -> StoreFuture<'a, StoreResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let key = key.to_string();
            let value = self
                .conn
                .call(move |conn| {
                    let value = conn
                        .query_row(
                            &format!("SELECT value FROM {table} WHERE key = ?1"),
                            rusqlite::params![key],
                            |row| row.get::<_, Vec<u8>>(0),
                        )
                        .optional()?;
                    Ok(value)
                })
                .await?;
            Ok(value)
        })
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let key = key.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (key, value) VALUES (?1, ?2)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                        ),
                        rusqlite::params![key, value],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}
