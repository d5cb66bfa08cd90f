use super::{AllData, DataKind, FeatureStore, StoreItem};
use crate::errors::StoreError;
use async_trait::async_trait;
use moka::sync::Cache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_PREFIX: &str = "launchdarkly";
const INITED_KEY: &str = "$inited";
const CACHE_CAPACITY: u64 = 10_000;

/// Cached read results: single items (including misses and tombstones) and
/// whole-kind listings.
#[derive(Clone)]
enum CacheEntry {
    Item(Option<StoreItem>),
    All(HashMap<String, StoreItem>),
}

/// Shared store backing. Items live under `<prefix>:<namespace>:<key>` as
/// JSON blobs, with a `<prefix>:$inited` sentinel written last during init.
/// A local TTL cache absorbs hot reads; writes go to Redis first and then
/// invalidate the affected cache entries.
pub struct RedisFeatureStore {
    manager: ConnectionManager,
    prefix: String,
    cache: Cache<String, CacheEntry>,
    // The stream reader is the only writer per environment; this mutex keeps
    // read-compare-write sequences whole across reconnect races.
    write_lock: Mutex<()>,
    inited: AtomicBool,
}

fn item_key(prefix: &str, kind: DataKind, key: &str) -> String {
    format!("{prefix}:{}:{key}", kind.namespace())
}

fn kind_pattern(prefix: &str, kind: DataKind) -> String {
    format!("{prefix}:{}:*", kind.namespace())
}

fn all_cache_key(kind: DataKind) -> String {
    format!("$all:{}", kind.namespace())
}

impl RedisFeatureStore {
    pub async fn new(
        host: &str,
        port: u16,
        prefix: Option<&str>,
        local_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => DEFAULT_PREFIX.to_string(),
        };

        let client = redis::Client::open(format!("redis://{host}:{port}"))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(local_ttl)
            .build();

        Ok(RedisFeatureStore {
            manager,
            prefix,
            cache,
            write_lock: Mutex::new(()),
            inited: AtomicBool::new(false),
        })
    }

    fn inited_key(&self) -> String {
        format!("{}:{INITED_KEY}", self.prefix)
    }

    async fn read_item(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let mut con = self.manager.clone();
        let blob: Option<String> = con.get(item_key(&self.prefix, kind, key)).await?;
        blob.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn scan_kind(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        let mut con = self.manager.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = con.scan_match::<_, String>(kind_pattern(&self.prefix, kind)).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut con = self.manager.clone();
        let blobs: Vec<Option<String>> = con.mget(&keys).await?;

        let name_start = self.prefix.len() + kind.namespace().len() + 2;
        let mut items = HashMap::new();
        for (key, blob) in keys.iter().zip(blobs) {
            let Some(raw) = blob else { continue };
            let item: StoreItem = serde_json::from_str(&raw)?;
            items.insert(key[name_start..].to_string(), item);
        }
        Ok(items)
    }

    fn invalidate(&self, kind: DataKind, key: &str) {
        self.cache.invalidate(&item_key(&self.prefix, kind, key));
        self.cache.invalidate(&all_cache_key(kind));
    }

    /// Write path shared by upsert and delete: apply iff strictly newer.
    async fn apply_versioned(
        &self,
        kind: DataKind,
        key: &str,
        item: StoreItem,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.read_item(kind, key).await? {
            if existing.version >= item.version {
                return Ok(false);
            }
        }

        let mut con = self.manager.clone();
        let blob = serde_json::to_string(&item)?;
        let _: () = con.set(item_key(&self.prefix, kind, key), blob).await?;

        self.invalidate(kind, key);
        Ok(true)
    }
}

#[async_trait]
impl FeatureStore for RedisFeatureStore {
    async fn init(&self, data: AllData) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        // Collect the keys to clear before building the transaction; the
        // sentinel is written last so a reader never observes the sentinel
        // without the items.
        let mut stale: Vec<String> = Vec::new();
        for kind in DataKind::ALL {
            let mut con = self.manager.clone();
            let mut iter = con.scan_match::<_, String>(kind_pattern(&self.prefix, kind)).await?;
            while let Some(key) = iter.next_item().await {
                stale.push(key);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in stale {
            pipe.del(key).ignore();
        }
        for kind in DataKind::ALL {
            for (key, item) in data.kind(kind) {
                let blob = serde_json::to_string(item)?;
                pipe.set(item_key(&self.prefix, kind, key), blob).ignore();
            }
        }
        pipe.set(self.inited_key(), "").ignore();

        let mut con = self.manager.clone();
        let _: () = pipe.query_async(&mut con).await?;

        self.cache.invalidate_all();
        self.inited.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let cache_key = item_key(&self.prefix, kind, key);
        if let Some(CacheEntry::Item(item)) = self.cache.get(&cache_key) {
            return Ok(item.filter(|i| !i.deleted));
        }

        let item = self.read_item(kind, key).await?;
        self.cache.insert(cache_key, CacheEntry::Item(item.clone()));
        Ok(item.filter(|i| !i.deleted))
    }

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        let cache_key = all_cache_key(kind);
        if let Some(CacheEntry::All(items)) = self.cache.get(&cache_key) {
            return Ok(items);
        }

        let mut items = self.scan_kind(kind).await?;
        items.retain(|_, item| !item.deleted);
        self.cache.insert(cache_key, CacheEntry::All(items.clone()));
        Ok(items)
    }

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool, StoreError> {
        self.apply_versioned(kind, key, item).await
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<bool, StoreError> {
        self.apply_versioned(kind, key, StoreItem::tombstone(version))
            .await
    }

    async fn initialized(&self) -> bool {
        // Latches true: the sentinel is never removed outside of init.
        if self.inited.load(Ordering::SeqCst) {
            return true;
        }

        let mut con = self.manager.clone();
        match con.exists::<_, bool>(self.inited_key()).await {
            Ok(true) => {
                self.inited.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(error = %err, "failed to check store init sentinel");
                false
            }
        }
    }
}
