//! SQLite-backed persistence.
//!
//! One row per `(client_id, key)` pair in a single table. `put` commits
//! synchronously on the blocking pool before returning, satisfying the
//! durability contract required for QoS 2 exactly-once semantics.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{PersistencePort, Result, StorageError};

#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Opens (creating if needed) a database file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory sqlite database; useful for tests that want the real
    /// backend's code path without a filesystem dependency.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                client_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (client_id, key)
            );
            CREATE TABLE IF NOT EXISTS clients (
                client_id TEXT PRIMARY KEY,
                server_uri TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Runs `f` against the shared connection on the blocking pool, the way
    /// the donor storage crate dispatches rusqlite calls out of the async
    /// runtime's worker threads.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::OperationFailed(e.to_string()))?
    }
}

#[async_trait]
impl PersistencePort for SqlitePersistence {
    async fn open(&self, client_id: &str, server_uri: &str) -> Result<()> {
        let client_id = client_id.to_string();
        let server_uri = server_uri.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO clients (client_id, server_uri) VALUES (?1, ?2)",
                params![client_id, server_uri],
            )?;
            Ok(())
        })
        .await
    }

    async fn put(&self, client_id: &str, key: &str, buffers: &[Bytes]) -> Result<()> {
        let value = crate::concat_buffers(buffers).to_vec();
        let client_id = client_id.to_string();
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO records (client_id, key, value) VALUES (?1, ?2, ?3)",
                params![client_id, key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, client_id: &str, key: &str) -> Result<Option<Bytes>> {
        let client_id = client_id.to_string();
        let key = key.to_string();
        self.blocking(move |conn| {
            let value: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM records WHERE client_id = ?1 AND key = ?2",
                    params![client_id, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn remove(&self, client_id: &str, key: &str) -> Result<()> {
        let client_id = client_id.to_string();
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE client_id = ?1 AND key = ?2",
                params![client_id, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn keys(&self, client_id: &str) -> Result<Vec<String>> {
        let client_id = client_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT key FROM records WHERE client_id = ?1")?;
            let rows = stmt.query_map(params![client_id], |row| row.get(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }

    async fn clear(&self, client_id: &str) -> Result<()> {
        let client_id = client_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE client_id = ?1",
                params![client_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn close(&self, _client_id: &str) -> Result<()> {
        // The connection is shared across clients and closed on drop; there
        // is nothing per-client to release.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{make_key, KeyTag};

    #[tokio::test]
    async fn put_get_remove_roundtrip() {
        let store = SqlitePersistence::in_memory().unwrap();
        store.open("client1", "tcp://localhost:1883").await.unwrap();

        let key = make_key(KeyTag::SentPublishV5, 7);
        store
            .put("client1", &key, &[Bytes::from_static(b"payload")])
            .await
            .unwrap();

        assert_eq!(
            store.get("client1", &key).await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );

        store.remove("client1", &key).await.unwrap();
        assert_eq!(store.get("client1", &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn persistence_across_instances_sharing_a_file() {
        let path = std::env::temp_dir().join(format!(
            "fernmqtt-storage-test-{}.sqlite3",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = SqlitePersistence::new(&path).unwrap();
            store.open("client1", "tcp://localhost").await.unwrap();
            store
                .put("client1", "o-1", &[Bytes::from_static(b"queued-command")])
                .await
                .unwrap();
        }

        {
            let store = SqlitePersistence::new(&path).unwrap();
            let value = store.get("client1", "o-1").await.unwrap();
            assert_eq!(value, Some(Bytes::from_static(b"queued-command")));
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn keys_scoped_per_client() {
        let store = SqlitePersistence::in_memory().unwrap();
        store.open("client1", "tcp://a").await.unwrap();
        store.open("client2", "tcp://b").await.unwrap();

        store
            .put("client1", "o-1", &[Bytes::from_static(b"a")])
            .await
            .unwrap();
        store
            .put("client2", "o-1", &[Bytes::from_static(b"b")])
            .await
            .unwrap();

        assert_eq!(store.keys("client1").await.unwrap(), vec!["o-1"]);
        assert_eq!(store.keys("client2").await.unwrap(), vec!["o-1"]);
    }

    #[tokio::test]
    async fn clear_only_affects_named_client() {
        let store = SqlitePersistence::in_memory().unwrap();
        store.open("client1", "tcp://a").await.unwrap();
        store.open("client2", "tcp://b").await.unwrap();
        store
            .put("client1", "o-1", &[Bytes::from_static(b"a")])
            .await
            .unwrap();
        store
            .put("client2", "o-1", &[Bytes::from_static(b"b")])
            .await
            .unwrap();

        store.clear("client1").await.unwrap();

        assert!(store.keys("client1").await.unwrap().is_empty());
        assert_eq!(store.keys("client2").await.unwrap(), vec!["o-1"]);
    }
}
