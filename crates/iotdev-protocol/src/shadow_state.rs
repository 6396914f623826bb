//! Shadow state algorithms: partial merge, desired/reported diff, and
//! metadata tree parsing.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{IotError, IotResult};
use crate::shadows::StateMap;

/// Merge a partial update into one state branch.
///
/// - an object value is merged recursively into the existing child
/// - `null` removes the key
/// - any other value overwrites the key
///
/// A `null` or empty-object update at the root clears the whole branch.
pub fn update_state(state: &mut Option<StateMap>, update: &Value) -> IotResult<()> {
    match update {
        Value::Null => {
            *state = None;
            Ok(())
        }
        Value::Object(map) if map.is_empty() => {
            *state = None;
            Ok(())
        }
        Value::Object(map) => {
            merge_object(state.get_or_insert_with(StateMap::new), map);
            Ok(())
        }
        other => Err(IotError::Decode(format!(
            "state update must be an object, got {other}"
        ))),
    }
}

fn merge_object(state: &mut StateMap, update: &StateMap) {
    for (key, value) in update {
        match value {
            Value::Object(child) => {
                let entry = state
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(StateMap::new()));
                if !entry.is_object() {
                    *entry = Value::Object(StateMap::new());
                }
                if let Value::Object(existing) = entry {
                    merge_object(existing, child);
                }
            }
            Value::Null => {
                state.remove(key);
            }
            leaf => {
                state.insert(key.clone(), leaf.clone());
            }
        }
    }
}

/// Keys of `input` that are added or changed relative to `base`.
///
/// Keys present only in `base` are not reported; deletions are expressed
/// explicitly with `null`. Returns `None` when nothing differs.
pub fn state_diff(base: &Value, input: &Value) -> Option<Value> {
    let base_map = match base {
        Value::Object(map) if !map.is_empty() => map,
        _ => return (input != base).then(|| input.clone()),
    };
    let Value::Object(input_map) = input else {
        return (input != base).then(|| input.clone());
    };

    let mut diff = StateMap::new();
    for (key, value) in input_map {
        match base_map.get(key) {
            Some(base_value) => {
                if let Some(changed) = state_diff(base_value, value) {
                    diff.insert(key.clone(), changed);
                }
            }
            None => {
                diff.insert(key.clone(), value.clone());
            }
        }
    }

    (!diff.is_empty()).then_some(Value::Object(diff))
}

/// Metadata tree of a shadow branch.
///
/// A leaf is an object with no nested objects (normally `{"timestamp": n}`).
#[derive(Debug, Clone, PartialEq)]
pub enum NestedMetadata {
    Leaf { timestamp: Option<u64> },
    List(Vec<NestedMetadata>),
    Object(BTreeMap<String, NestedMetadata>),
}

impl NestedMetadata {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => NestedMetadata::List(items.iter().map(Self::from_value).collect()),
            Value::Object(map) if map.values().any(contains_object) => NestedMetadata::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_value(v)))
                    .collect(),
            ),
            Value::Object(map) => NestedMetadata::Leaf {
                timestamp: map.get("timestamp").and_then(Value::as_u64),
            },
            _ => NestedMetadata::Leaf { timestamp: None },
        }
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            NestedMetadata::Leaf { timestamp } => *timestamp,
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&NestedMetadata> {
        match self {
            NestedMetadata::Object(children) => children.get(key),
            _ => None,
        }
    }

    /// Most recent timestamp anywhere in the tree.
    pub fn latest(&self) -> Option<u64> {
        match self {
            NestedMetadata::Leaf { timestamp } => *timestamp,
            NestedMetadata::List(items) => items.iter().filter_map(Self::latest).max(),
            NestedMetadata::Object(children) => children.values().filter_map(Self::latest).max(),
        }
    }
}

fn contains_object(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(contains_object),
        _ => false,
    }
}
