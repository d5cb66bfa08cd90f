//! Versioned keyed storage for flag data, one store per environment.
//!
//! Two backings exist: a process-local map and a shared Redis store with a
//! local read cache. Both enforce the same write discipline: a write is
//! applied only when its version is strictly greater than the stored one, and
//! deletions leave a versioned tombstone so late-arriving stale writes cannot
//! resurrect an item.

mod memory;
mod redis;

pub use self::memory::InMemoryFeatureStore;
pub use self::redis::RedisFeatureStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two kinds of data the upstream service streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Features, DataKind::Segments];

    /// Namespace segment used in persistent store keys.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Path segment used in stream event paths, e.g. `/flags/my-key`.
    pub fn path_name(&self) -> &'static str {
        match self {
            DataKind::Features => "flags",
            DataKind::Segments => "segments",
        }
    }

    pub fn from_path_name(name: &str) -> Option<DataKind> {
        match name {
            "flags" => Some(DataKind::Features),
            "segments" => Some(DataKind::Segments),
            _ => None,
        }
    }
}

/// A stored item: an opaque JSON payload plus the version/tombstone envelope
/// the store needs to order writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    pub data: serde_json::Value,
}

impl StoreItem {
    /// Wraps a raw upstream payload, reading `version` out of the JSON
    /// (absent or malformed versions order first).
    pub fn from_json(data: serde_json::Value) -> Self {
        let version = data.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        StoreItem {
            version,
            deleted: false,
            data,
        }
    }

    pub fn tombstone(version: u64) -> Self {
        StoreItem {
            version,
            deleted: true,
            data: serde_json::Value::Null,
        }
    }
}

/// A complete snapshot for one environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllData {
    pub flags: HashMap<String, StoreItem>,
    pub segments: HashMap<String, StoreItem>,
}

impl AllData {
    pub fn kind(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Features => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }
}

/// Keyed store of flag data with monotonic-version writes.
///
/// `get` and `all` never expose tombstones. `upsert` and `delete` report
/// whether the write was applied; a stale version is a silent no-op so that
/// replayed upstream events stay idempotent.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Atomically replaces all items and marks the store initialized.
    async fn init(&self, data: AllData) -> Result<(), StoreError>;

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, StoreError>;

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, StoreError>;

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool, StoreError>;

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> Result<bool, StoreError>;

    /// True once `init` has completed at least once (here or, for shared
    /// backings, in any other relay instance writing the same prefix).
    async fn initialized(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_from_json_reads_version() {
        let item = StoreItem::from_json(json!({"key": "x", "version": 7, "on": true}));
        assert_eq!(item.version, 7);
        assert!(!item.deleted);
    }

    #[test]
    fn item_from_json_defaults_missing_version() {
        let item = StoreItem::from_json(json!({"key": "x"}));
        assert_eq!(item.version, 0);
    }

    #[test]
    fn item_blob_round_trips() {
        let item = StoreItem::from_json(json!({"key": "x", "version": 3}));
        let blob = serde_json::to_vec(&item).unwrap();
        let back: StoreItem = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn tombstone_blob_keeps_deleted_flag() {
        let blob = serde_json::to_vec(&StoreItem::tombstone(9)).unwrap();
        let back: StoreItem = serde_json::from_slice(&blob).unwrap();
        assert!(back.deleted);
        assert_eq!(back.version, 9);
    }
}
