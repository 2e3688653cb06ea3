//! Last-value-per-topic persistence.
//!
//! The relay only needs `get_item` / `set_item` (plus `remove_item` for
//! housekeeping). No transactions or versioning: two connections doing a
//! read-modify-write on the same key race, and the later write wins unless
//! the relay runs in [`crate::WriteMode::Serialized`].

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn remove_item(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StoreError> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove_item(key).await
    }
}

// ==================== MemoryStore ====================

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.items.get(key).map(|v| v.value().clone()))
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.items.remove(key);
        Ok(())
    }
}

// ==================== PrefixedStore ====================

/// Default namespace for topic records.
pub const DEFAULT_PREFIX: &str = "ws:";

/// Namespaces every key of an inner store under a fixed prefix.
pub struct PrefixedStore<S> {
    inner: S,
    prefix: String,
}

impl<S: KeyValueStore> PrefixedStore<S> {
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    /// Wrap `inner` with the [`DEFAULT_PREFIX`].
    pub fn with_default_prefix(inner: S) -> Self {
        Self::new(inner, DEFAULT_PREFIX)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for PrefixedStore<S> {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_item(&self.key(key)).await
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set_item(&self.key(key), value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove_item(&self.key(key)).await
    }
}

// ==================== SqliteStore ====================

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    /// Durable store backed by a single SQLite table. Values are kept as
    /// JSON text.
    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?)
        }

        pub fn in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );",
            )?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
            self.conn.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteStore {
        async fn get_item(&self, key: &str) -> Result<Option<Value>, StoreError> {
            let raw: Option<String> = self
                .conn()
                .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }

        async fn set_item(&self, key: &str, value: Value) -> Result<(), StoreError> {
            let raw = serde_json::to_string(&value)?;
            self.conn().execute(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, raw],
            )?;
            Ok(())
        }

        async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
            self.conn().execute("DELETE FROM kv WHERE key = ?", [key])?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert_eq!(store.get_item("k").await.unwrap(), None);

        store.set_item("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap(), Some(json!({"a": 1})));

        store.set_item("k", json!([1, 2])).await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap(), Some(json!([1, 2])));

        store.remove_item("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_prefixed_store_namespaces_keys() {
        let inner = Arc::new(MemoryStore::new());
        let store = PrefixedStore::with_default_prefix(inner.clone());

        store.set_item("page:1", json!(1)).await.unwrap();

        assert_eq!(inner.keys(), vec!["ws:page:1"]);
        assert_eq!(store.get_item("page:1").await.unwrap(), Some(json!(1)));
        assert_eq!(inner.get_item("page:1").await.unwrap(), None);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set_item("page:1", json!([{"x": 1, "peerId": "a"}]))
                .await
                .unwrap();
            store.set_item("page:1", json!([{"x": 2, "peerId": "a"}])).await.unwrap();
            store.set_item("gone", json!(true)).await.unwrap();
            store.remove_item("gone").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get_item("page:1").await.unwrap(),
            Some(json!([{"x": 2, "peerId": "a"}]))
        );
        assert_eq!(store.get_item("gone").await.unwrap(), None);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_store_rejects_corrupt_rows() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .conn()
            .execute("INSERT INTO kv (key, value) VALUES ('bad', '{oops')", [])
            .unwrap();
        assert!(matches!(
            store.get_item("bad").await,
            Err(StoreError::Serialization(_))
        ));
    }
}
