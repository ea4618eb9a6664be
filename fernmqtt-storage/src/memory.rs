//! In-memory persistence backend.
//!
//! No durability across process restart; used by default when a client is
//! created without a persistence directory, and in tests.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{concat_buffers, PersistencePort, Result, StorageError};

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    clients: Arc<RwLock<HashMap<String, HashMap<String, Bytes>>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistencePort for MemoryPersistence {
    async fn open(&self, client_id: &str, _server_uri: &str) -> Result<()> {
        let mut clients = self
            .clients
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        clients.entry(client_id.to_string()).or_default();
        Ok(())
    }

    async fn put(&self, client_id: &str, key: &str, buffers: &[Bytes]) -> Result<()> {
        let mut clients = self
            .clients
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        let store = clients
            .get_mut(client_id)
            .ok_or_else(|| StorageError::NotOpen(client_id.to_string()))?;
        store.insert(key.to_string(), concat_buffers(buffers));
        Ok(())
    }

    async fn get(&self, client_id: &str, key: &str) -> Result<Option<Bytes>> {
        let clients = self
            .clients
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        let store = clients
            .get(client_id)
            .ok_or_else(|| StorageError::NotOpen(client_id.to_string()))?;
        Ok(store.get(key).cloned())
    }

    async fn remove(&self, client_id: &str, key: &str) -> Result<()> {
        let mut clients = self
            .clients
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        if let Some(store) = clients.get_mut(client_id) {
            store.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, client_id: &str) -> Result<Vec<String>> {
        let clients = self
            .clients
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(clients
            .get(client_id)
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, client_id: &str) -> Result<()> {
        let mut clients = self
            .clients
            .write()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        if let Some(store) = clients.get_mut(client_id) {
            store.clear();
        }
        Ok(())
    }

    async fn close(&self, client_id: &str) -> Result<()> {
        // Nothing to release; data survives close (erased only by `clear`).
        let clients = self
            .clients
            .read()
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        if !clients.contains_key(client_id) {
            return Err(StorageError::NotOpen(client_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{make_key, KeyTag};

    #[tokio::test]
    async fn put_get_remove_roundtrip() {
        let store = MemoryPersistence::new();
        store.open("client1", "tcp://localhost:1883").await.unwrap();

        let key = make_key(KeyTag::SentPublishV5, 1);
        store
            .put("client1", &key, &[Bytes::from_static(b"hello")])
            .await
            .unwrap();

        assert_eq!(
            store.get("client1", &key).await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );

        store.remove("client1", &key).await.unwrap();
        assert_eq!(store.get("client1", &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn operations_before_open_fail() {
        let store = MemoryPersistence::new();
        let err = store.put("client1", "o-0", &[Bytes::new()]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn keys_lists_everything_under_a_client() {
        let store = MemoryPersistence::new();
        store.open("client1", "tcp://localhost").await.unwrap();

        store
            .put("client1", "o-1", &[Bytes::from_static(b"a")])
            .await
            .unwrap();
        store
            .put("client1", "o-2", &[Bytes::from_static(b"b")])
            .await
            .unwrap();

        let mut keys = store.keys("client1").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["o-1".to_string(), "o-2".to_string()]);
    }

    #[tokio::test]
    async fn put_concatenates_multiple_buffers() {
        let store = MemoryPersistence::new();
        store.open("client1", "tcp://localhost").await.unwrap();

        store
            .put(
                "client1",
                "o-1",
                &[Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
            )
            .await
            .unwrap();

        assert_eq!(
            store.get("client1", "o-1").await.unwrap(),
            Some(Bytes::from_static(b"abcd"))
        );
    }

    #[tokio::test]
    async fn clear_empties_a_single_clients_keys() {
        let store = MemoryPersistence::new();
        store.open("client1", "tcp://localhost").await.unwrap();
        store
            .put("client1", "o-1", &[Bytes::from_static(b"a")])
            .await
            .unwrap();

        store.clear("client1").await.unwrap();
        assert!(store.keys("client1").await.unwrap().is_empty());
    }
}
