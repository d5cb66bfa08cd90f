//! Store adapter that turns every applied mutation into a stream event.
//!
//! Wrapping the environment's backing store guarantees the store and the
//! downstream SSE stream cannot diverge: an event is published if and only if
//! the delegate accepted the write, and the replay sent to new subscribers is
//! rendered from the same store.

use crate::errors::StoreError;
use crate::sse::{Event, EventPublisher, Replay};
use crate::store::{AllData, DataKind, FeatureStore, StoreItem};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn item_path(kind: DataKind, key: &str) -> String {
    format!("/{}/{}", kind.path_name(), key)
}

fn envelope(items: &HashMap<String, StoreItem>) -> serde_json::Value {
    let live: serde_json::Map<String, serde_json::Value> = items
        .iter()
        .filter(|(_, item)| !item.deleted)
        .map(|(key, item)| (key.clone(), item.data.clone()))
        .collect();
    serde_json::Value::Object(live)
}

fn put_event(flags: &HashMap<String, StoreItem>, segments: &HashMap<String, StoreItem>) -> Event {
    let data = json!({
        "path": "/",
        "data": {
            "flags": envelope(flags),
            "segments": envelope(segments),
        }
    });
    Event::new("put", data.to_string())
}

/// Replay source registered with the publisher: renders the current snapshot
/// as a single `put` at subscribe time, so late joiners always start from the
/// live store contents.
struct SnapshotReplay {
    store: Arc<dyn FeatureStore>,
}

#[async_trait]
impl Replay for SnapshotReplay {
    async fn replay(&self) -> Option<Event> {
        if !self.store.initialized().await {
            return None;
        }
        let flags = self.store.all(DataKind::Features).await.ok()?;
        let segments = self.store.all(DataKind::Segments).await.ok()?;
        Some(put_event(&flags, &segments))
    }
}

pub struct RelayFeatureStore {
    inner: Arc<dyn FeatureStore>,
    publisher: Arc<EventPublisher>,
    channel: String,
}

impl RelayFeatureStore {
    /// Wraps `inner` and registers the environment's channel (named by the
    /// server credential) with its snapshot replay source.
    pub fn new(
        inner: Arc<dyn FeatureStore>,
        publisher: Arc<EventPublisher>,
        channel: &str,
    ) -> Arc<Self> {
        publisher.register(
            channel,
            Arc::new(SnapshotReplay {
                store: inner.clone(),
            }),
        );

        Arc::new(RelayFeatureStore {
            inner,
            publisher,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl FeatureStore for RelayFeatureStore {
    async fn init(&self, data: AllData) -> Result<(), StoreError> {
        self.inner.init(data.clone()).await?;
        self.publisher
            .publish(&self.channel, &put_event(&data.flags, &data.segments));
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError> {
        self.inner.get(kind, key).await
    }

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError> {
        self.inner.all(kind).await
    }

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool, StoreError> {
        let data = item.data.clone();
        let applied = self.inner.upsert(kind, key, item).await?;
        if applied {
            let payload = json!({"path": item_path(kind, key), "data": data});
            self.publisher
                .publish(&self.channel, &Event::new("patch", payload.to_string()));
        }
        Ok(applied)
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<bool, StoreError> {
        let applied = self.inner.delete(kind, key, version).await?;
        if applied {
            let payload = json!({"path": item_path(kind, key), "version": version});
            self.publisher
                .publish(&self.channel, &Event::new("delete", payload.to_string()));
        }
        Ok(applied)
    }

    async fn initialized(&self) -> bool {
        self.inner.initialized().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryFeatureStore;
    use bytes::Bytes;
    use http_body_util::combinators::BoxBody;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::convert::Infallible;
    use std::time::Duration;

    fn relay_store(publisher: &Arc<EventPublisher>, channel: &str) -> Arc<RelayFeatureStore> {
        RelayFeatureStore::new(
            Arc::new(InMemoryFeatureStore::new()),
            publisher.clone(),
            channel,
        )
    }

    fn flag(key: &str, version: u64) -> StoreItem {
        StoreItem::from_json(json!({"key": key, "version": version}))
    }

    async fn next_event(body: &mut BoxBody<Bytes, Infallible>) -> (String, Value) {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("frame error");
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();

        let name = text
            .lines()
            .find_map(|l| l.strip_prefix("event: "))
            .expect("missing event line")
            .to_string();
        let data: String = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        (name, serde_json::from_str(&data).unwrap())
    }

    fn snapshot(flags: &[(&str, u64)]) -> AllData {
        AllData {
            flags: flags
                .iter()
                .map(|(k, v)| (k.to_string(), flag(k, *v)))
                .collect(),
            segments: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn init_publishes_two_kind_envelope() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");

        let mut body = publisher.subscribe("chan").await.unwrap();
        store.init(snapshot(&[("x", 1), ("y", 1)])).await.unwrap();

        let (name, data) = next_event(&mut body).await;
        assert_eq!(name, "put");
        assert_eq!(data["path"], "/");
        assert_eq!(data["data"]["flags"]["x"]["version"], 1);
        assert_eq!(data["data"]["flags"]["y"]["version"], 1);
        assert!(data["data"]["segments"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_on_connect_carries_current_snapshot() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");

        store.init(snapshot(&[("x", 1)])).await.unwrap();
        store
            .upsert(DataKind::Features, "x", flag("x", 2))
            .await
            .unwrap();

        let mut body = publisher.subscribe("chan").await.unwrap();
        let (name, data) = next_event(&mut body).await;
        assert_eq!(name, "put");
        assert_eq!(data["data"]["flags"]["x"]["version"], 2);
    }

    #[tokio::test]
    async fn no_replay_before_first_init() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");

        let mut body = publisher.subscribe("chan").await.unwrap();

        // Nothing replayed; the first event is the live init.
        store.init(snapshot(&[("x", 1)])).await.unwrap();
        let (name, _) = next_event(&mut body).await;
        assert_eq!(name, "put");
    }

    #[tokio::test]
    async fn accepted_patch_is_published_with_item_path() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");
        store.init(snapshot(&[("x", 1)])).await.unwrap();

        let mut body = publisher.subscribe("chan").await.unwrap();
        let _ = next_event(&mut body).await; // replay

        store
            .upsert(DataKind::Features, "x", flag("x", 2))
            .await
            .unwrap();

        let (name, data) = next_event(&mut body).await;
        assert_eq!(name, "patch");
        assert_eq!(data["path"], "/flags/x");
        assert_eq!(data["data"]["version"], 2);
    }

    #[tokio::test]
    async fn stale_patch_publishes_nothing_and_keeps_version() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");
        store.init(snapshot(&[("x", 3)])).await.unwrap();

        let mut body = publisher.subscribe("chan").await.unwrap();
        let _ = next_event(&mut body).await; // replay

        let applied = store
            .upsert(DataKind::Features, "x", flag("x", 2))
            .await
            .unwrap();
        assert!(!applied);

        let current = store.get(DataKind::Features, "x").await.unwrap().unwrap();
        assert_eq!(current.version, 3);

        // The next observable event is a fresh delete, not the stale patch.
        store.delete(DataKind::Features, "y", 1).await.unwrap();
        let (name, data) = next_event(&mut body).await;
        assert_eq!(name, "delete");
        assert_eq!(data["path"], "/flags/y");
        assert_eq!(data["version"], 1);
    }

    #[tokio::test]
    async fn subscribers_converge_regardless_of_connect_instant() {
        let publisher = Arc::new(EventPublisher::new(None));
        let store = relay_store(&publisher, "chan");

        store.init(snapshot(&[("x", 1), ("y", 1)])).await.unwrap();
        let mut early = publisher.subscribe("chan").await.unwrap();

        store
            .upsert(DataKind::Features, "x", flag("x", 2))
            .await
            .unwrap();
        store.delete(DataKind::Features, "y", 2).await.unwrap();

        let mut late = publisher.subscribe("chan").await.unwrap();

        // Early subscriber applies replay + patch + delete on an empty map.
        let mut early_state: HashMap<String, Value> = HashMap::new();
        let (name, data) = next_event(&mut early).await;
        assert_eq!(name, "put");
        for (k, v) in data["data"]["flags"].as_object().unwrap() {
            early_state.insert(k.clone(), v.clone());
        }
        let (name, data) = next_event(&mut early).await;
        assert_eq!(name, "patch");
        early_state.insert("x".to_string(), data["data"].clone());
        let (name, data) = next_event(&mut early).await;
        assert_eq!(name, "delete");
        assert_eq!(data["path"], "/flags/y");
        early_state.remove("y");

        // Late subscriber gets the same live set in its replay.
        let (_, data) = next_event(&mut late).await;
        let late_state = data["data"]["flags"].as_object().unwrap();

        assert_eq!(early_state.len(), late_state.len());
        assert_eq!(early_state["x"]["version"], late_state["x"]["version"]);
    }
}
