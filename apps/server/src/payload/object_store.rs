//! `object_store` backed payload persistence (in-memory or local filesystem).

use super::{payload_key, PayloadPersistence};
use crate::error::{Error, Result};
use ::object_store::local::LocalFileSystem;
use ::object_store::memory::InMemory;
use ::object_store::path::Path;
use ::object_store::{ObjectStore, PutPayload};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;

pub struct ObjectStorePayloadPersistence {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorePayloadPersistence {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Payloads under `root`, created if missing.
    pub fn local(root: &str) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| Error::Payload(format!("Failed to create payload root '{}': {}", root, e)))?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store)))
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize> {
        let objects: Vec<_> = self.store.list(Some(prefix)).try_collect().await?;
        let mut deleted = 0;
        for object in objects {
            match self.store.delete(&object.location).await {
                Ok(()) => deleted += 1,
                Err(::object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl PayloadPersistence for ObjectStorePayloadPersistence {
    async fn store_payload(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: i32,
        data: Vec<u8>,
    ) -> Result<String> {
        let payload_id = uuid::Uuid::new_v4().simple().to_string();
        let key = payload_key(resource_type, logical_id, version_id, &payload_id);
        self.store
            .put(&Path::from(key.as_str()), PutPayload::from(data))
            .await?;
        Ok(key)
    }

    async fn read_payload(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = match self.store.get(&Path::from(key)).await {
            Ok(result) => result,
            Err(::object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete_payload(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: Option<i32>,
    ) -> Result<()> {
        let prefix = match version_id {
            Some(v) => format!("{resource_type}/{logical_id}/{v}"),
            None => format!("{resource_type}/{logical_id}"),
        };
        let deleted = self.delete_prefix(&Path::from(prefix.as_str())).await?;
        tracing::debug!(prefix = %prefix, deleted, "Deleted offloaded payloads");
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(::object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_payload_scopes_to_version() {
        let store = ObjectStorePayloadPersistence::in_memory();
        let k1 = store.store_payload("Patient", "p1", 1, b"one".to_vec()).await.unwrap();
        let k2 = store.store_payload("Patient", "p1", 2, b"two".to_vec()).await.unwrap();
        let other = store.store_payload("Patient", "p10", 1, b"x".to_vec()).await.unwrap();

        store.delete_payload("Patient", "p1", Some(1)).await.unwrap();
        assert!(store.read_payload(&k1).await.unwrap().is_none());
        assert_eq!(store.read_payload(&k2).await.unwrap().as_deref(), Some(&b"two"[..]));

        store.delete_payload("Patient", "p1", None).await.unwrap();
        assert!(store.read_payload(&k2).await.unwrap().is_none());
        // Prefixes match whole path segments.
        assert!(store.read_payload(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_backend_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStorePayloadPersistence::local(dir.path().to_str().unwrap()).unwrap();
        let key = store.store_payload("Observation", "o1", 3, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.read_payload(&key).await.unwrap(), Some(vec![1, 2, 3]));
        store.delete_key(&key).await.unwrap();
        store.delete_key(&key).await.unwrap();
    }
}
