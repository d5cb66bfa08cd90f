use super::{AllData, DataKind, FeatureStore, StoreItem};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryData {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
    initialized: bool,
}

impl MemoryData {
    fn items(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Features => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn items_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Features => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }
}

/// Process-local store backing. Many concurrent readers, one writer; the
/// lock is never held across I/O.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    data: RwLock<MemoryData>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    async fn init(&self, data: AllData) -> Result<(), StoreError> {
        let mut guard = self.data.write();
        guard.flags = data.flags;
        guard.segments = data.segments;
        guard.initialized = true;
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let guard = self.data.read();
        Ok(guard
            .items(kind)
            .get(key)
            .filter(|item| !item.deleted)
            .cloned())
    }

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        let guard = self.data.read();
        Ok(guard
            .items(kind)
            .iter()
            .filter(|(_, item)| !item.deleted)
            .map(|(k, item)| (k.clone(), item.clone()))
            .collect())
    }

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool, StoreError> {
        let mut guard = self.data.write();
        let items = guard.items_mut(kind);
        match items.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                items.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<bool, StoreError> {
        self.upsert(kind, key, StoreItem::tombstone(version)).await
    }

    async fn initialized(&self) -> bool {
        self.data.read().initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(version: u64) -> StoreItem {
        StoreItem::from_json(json!({"key": "x", "version": version}))
    }

    #[tokio::test]
    async fn init_replaces_everything() {
        let store = InMemoryFeatureStore::new();
        assert!(!store.initialized().await);

        let mut flags = HashMap::new();
        flags.insert("old".to_string(), item(1));
        store
            .init(AllData {
                flags,
                segments: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(store.initialized().await);

        let mut flags = HashMap::new();
        flags.insert("new".to_string(), item(1));
        store
            .init(AllData {
                flags,
                segments: HashMap::new(),
            })
            .await
            .unwrap();

        assert!(store.get(DataKind::Features, "old").await.unwrap().is_none());
        assert!(store.get(DataKind::Features, "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upsert_rejects_stale_and_equal_versions() {
        let store = InMemoryFeatureStore::new();
        assert!(store.upsert(DataKind::Features, "x", item(3)).await.unwrap());
        assert!(!store.upsert(DataKind::Features, "x", item(2)).await.unwrap());
        assert!(!store.upsert(DataKind::Features, "x", item(3)).await.unwrap());
        assert!(store.upsert(DataKind::Features, "x", item(4)).await.unwrap());

        let stored = store.get(DataKind::Features, "x").await.unwrap().unwrap();
        assert_eq!(stored.version, 4);
    }

    #[tokio::test]
    async fn out_of_order_patches_end_with_newest() {
        let store = InMemoryFeatureStore::new();
        assert!(store.upsert(DataKind::Features, "x", item(2)).await.unwrap());
        assert!(!store.upsert(DataKind::Features, "x", item(1)).await.unwrap());
        let stored = store.get(DataKind::Features, "x").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn delete_tombstones_and_blocks_stale_resurrection() {
        let store = InMemoryFeatureStore::new();
        store.upsert(DataKind::Features, "x", item(2)).await.unwrap();
        assert!(store.delete(DataKind::Features, "x", 5).await.unwrap());

        assert!(store.get(DataKind::Features, "x").await.unwrap().is_none());
        assert!(store.all(DataKind::Features).await.unwrap().is_empty());

        assert!(!store.upsert(DataKind::Features, "x", item(4)).await.unwrap());
        assert!(store.upsert(DataKind::Features, "x", item(6)).await.unwrap());
        assert!(store.get(DataKind::Features, "x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let store = InMemoryFeatureStore::new();
        store.upsert(DataKind::Features, "x", item(1)).await.unwrap();
        assert!(store.get(DataKind::Segments, "x").await.unwrap().is_none());
    }
}
