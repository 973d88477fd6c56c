use std::collections::HashMap;

use async_trait::async_trait;
use corral_id::FrameworkId;
use corral_protocol::FrameworkInfo;
use tokio::sync::RwLock;

use super::{FrameworksStorage, StorageError};

/// In-process storage. Contents are lost when the master exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    infos: RwLock<HashMap<FrameworkId, FrameworkInfo>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with `infos`, as if left over from a prior run.
    pub fn with_infos(infos: HashMap<FrameworkId, FrameworkInfo>) -> Self {
        Self {
            infos: RwLock::new(infos),
        }
    }

    pub async fn len(&self) -> usize {
        self.infos.read().await.len()
    }
}

#[async_trait]
impl FrameworksStorage for MemoryStorage {
    async fn list(&self) -> Result<HashMap<FrameworkId, FrameworkInfo>, StorageError> {
        Ok(self.infos.read().await.clone())
    }

    async fn persist_add(&self, id: FrameworkId, info: &FrameworkInfo) -> Result<(), StorageError> {
        self.infos.write().await.insert(id, info.clone());
        Ok(())
    }

    async fn persist_remove(&self, id: FrameworkId) -> Result<(), StorageError> {
        self.infos.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_add_list_remove() {
        let storage = MemoryStorage::new();
        let id = FrameworkId::new();
        let info = FrameworkInfo::new("web", "svc");

        storage.persist_add(id, &info).await.unwrap();
        assert_eq!(storage.list().await.unwrap().get(&id), Some(&info));

        storage.persist_remove(id).await.unwrap();
        storage.persist_remove(id).await.unwrap();
        assert_eq!(storage.len().await, 0);
    }
}
