//! Content-addressed image persistence.
//!
//! Programs are keyed by module id, instances by `<principal>.<uuid>`. The
//! default store keeps everything in memory; durable backends implement the
//! same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::image::InstanceImage;
use crate::types::{ModuleId, Result};

/// Persistence contract for program content and instance state.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Store canonical module bytes under the module id. Idempotent.
    async fn store_program(&self, id: &ModuleId, content: Bytes) -> Result<()>;

    /// Load module bytes, or `None` if the id is unknown.
    async fn load_program(&self, id: &ModuleId) -> Result<Option<Bytes>>;

    async fn delete_program(&self, id: &ModuleId) -> Result<()>;

    async fn list_programs(&self) -> Result<Vec<ModuleId>>;

    /// Store instance state under a `<principal>.<uuid>` key. The record
    /// carries the current trap id and result so that a terminal status can
    /// be derived after restart without executing.
    async fn store_instance(&self, key: &str, state: &InstanceImage) -> Result<()>;

    async fn load_instance(&self, key: &str) -> Result<Option<InstanceImage>>;

    async fn delete_instance(&self, key: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<String>>;
}

/// In-memory store, the construction default. State does not survive the
/// process; useful for tests and transient deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    programs: Mutex<HashMap<ModuleId, Bytes>>,
    instances: Mutex<HashMap<String, InstanceImage>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageStorage for MemoryStorage {
    async fn store_program(&self, id: &ModuleId, content: Bytes) -> Result<()> {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), content);
        Ok(())
    }

    async fn load_program(&self, id: &ModuleId) -> Result<Option<Bytes>> {
        Ok(self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn delete_program(&self, id: &ModuleId) -> Result<()> {
        self.programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    async fn list_programs(&self) -> Result<Vec<ModuleId>> {
        Ok(self
            .programs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn store_instance(&self, key: &str, state: &InstanceImage) -> Result<()> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn load_instance(&self, key: &str) -> Result<Option<InstanceImage>> {
        Ok(self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn delete_instance(&self, key: &str) -> Result<()> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_program_round_trip() {
        let storage = MemoryStorage::new();
        let id = ModuleId::from_string("abc".to_string()).unwrap();
        let content = Bytes::from_static(b"\0asm\x01\0\0\0");

        storage.store_program(&id, content.clone()).await.unwrap();
        assert_eq!(storage.load_program(&id).await.unwrap(), Some(content));
        assert_eq!(storage.list_programs().await.unwrap(), vec![id.clone()]);

        storage.delete_program(&id).await.unwrap();
        assert_eq!(storage.load_program(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_instance() {
        let storage = MemoryStorage::new();
        assert!(storage.load_instance("pri.key").await.unwrap().is_none());
        storage.delete_instance("pri.key").await.unwrap();
    }
}
