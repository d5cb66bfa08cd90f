//! Flag evaluation, delegated to the upstream SDK's evaluation library.
//!
//! The relay stores payloads as opaque JSON; this module deserialises them
//! into the evaluation library's types at request time and evaluates every
//! flag against the caller's context. Prerequisite flags and segments are
//! resolved from the same snapshot.

use crate::store::StoreItem;
use launchdarkly_server_sdk_evaluation::{evaluate, Context, Flag, Segment, Store};
use std::collections::HashMap;

/// Owned snapshot of one environment's data, shaped for the evaluator.
struct EvalSnapshot {
    flags: HashMap<String, Flag>,
    segments: HashMap<String, Segment>,
}

impl Store for EvalSnapshot {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments.get(segment_key).cloned()
    }
}

fn deserialize_items<T: serde::de::DeserializeOwned>(
    kind: &str,
    items: &HashMap<String, StoreItem>,
) -> HashMap<String, T> {
    items
        .iter()
        .filter_map(|(key, item)| match serde_json::from_value(item.data.clone()) {
            Ok(parsed) => Some((key.clone(), parsed)),
            Err(err) => {
                tracing::warn!(kind, key = %key, error = %err, "skipping undecodable item");
                None
            }
        })
        .collect()
}

/// Evaluates every live flag for `context`, returning flag key → value.
/// Flags whose evaluation produces no value map to JSON null.
pub fn all_flag_values(
    flags: &HashMap<String, StoreItem>,
    segments: &HashMap<String, StoreItem>,
    context: &Context,
) -> HashMap<String, serde_json::Value> {
    let snapshot = EvalSnapshot {
        flags: deserialize_items("flag", flags),
        segments: deserialize_items("segment", segments),
    };

    snapshot
        .flags
        .iter()
        .map(|(key, flag)| {
            let detail = evaluate(&snapshot, flag, context, None);
            let value = detail
                .value
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or(serde_json::Value::Null);
            (key.clone(), value)
        })
        .collect()
}

/// Parses a caller-supplied user/context JSON document.
pub fn context_from_json(value: serde_json::Value) -> Result<Context, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}
