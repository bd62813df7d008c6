//! Per-entity metadata bag.
//!
//! The bag is the only channel through which one queued step hands state to
//! a later step of the same chain. Reads are strict: asking for a key that an
//! earlier step never wrote is a wiring bug and fails loudly with the caller's
//! location instead of silently defaulting.

use std::panic::Location;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::EntityRef;
use crate::error::CoreError;

/// Pointer to the step currently running, or a terminal marker.
pub const KEY_CURRENT_STEP: &str = "current_step";

/// Map of step id to its [`StepRecord`](crate::workflow::StepRecord).
pub const KEY_STEP_HISTORY: &str = "step_history";

/// Name of the pipeline whose step definitions the history belongs to.
pub const KEY_WORKFLOW: &str = "workflow";

/// Keys owned by workflow tracking, cleared when a chain starts over.
pub const WORKFLOW_KEYS: [&str; 3] = [KEY_CURRENT_STEP, KEY_STEP_HISTORY, KEY_WORKFLOW];

/// How [`MetadataBag::merge`] treats keys that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Overlapping top-level keys are replaced by the incoming value.
    Overwrite,
    /// Objects merge recursively, arrays are appended, and existing scalar
    /// values are kept.
    DeepMerge,
}

/// A versioned key-value bag attached to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataBag {
    entity: EntityRef,
    values: Map<String, Value>,
    version: i64,
}

impl MetadataBag {
    /// Wrap a stored JSON value. Anything other than an object (e.g. a NULL
    /// column) is treated as an empty bag.
    pub fn new(entity: EntityRef, value: Value, version: i64) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            entity,
            values,
            version,
        }
    }

    pub fn empty(entity: EntityRef) -> Self {
        Self::new(entity, Value::Null, 0)
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    /// Write counter; bumped by every merge.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Strict lookup.
    ///
    /// Fails with [`CoreError::MetadataKeyNotFound`] carrying the key, the
    /// owning entity, the available keys and the caller's source location.
    #[track_caller]
    pub fn get(&self, key: &str) -> Result<&Value, CoreError> {
        let caller = Location::caller();
        self.values.get(key).ok_or_else(|| self.missing(key, caller))
    }

    /// Strict typed lookup.
    #[track_caller]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, CoreError> {
        let caller = Location::caller();
        let value = self
            .values
            .get(key)
            .ok_or_else(|| self.missing(key, caller))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            CoreError::Validation(format!(
                "metadata key '{key}' on {} has an unexpected shape: {e}",
                self.entity
            ))
        })
    }

    /// Lookup with an explicit fallback.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.values.get(key).cloned().unwrap_or(default)
    }

    /// Non-failing lookup for optional keys.
    pub fn get_opt(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn all(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Sorted key list, as reported in missing-key errors.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Merge `partial` into the bag and bump the version.
    pub fn merge(&mut self, partial: Map<String, Value>, mode: MergeMode) {
        for (key, incoming) in partial {
            match mode {
                MergeMode::Overwrite => {
                    self.values.insert(key, incoming);
                }
                MergeMode::DeepMerge => match self.values.get_mut(&key) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => {
                        self.values.insert(key, incoming);
                    }
                },
            }
        }
        self.version += 1;
    }

    /// Drop keys and bump the version. Used when a failed chain is reset.
    pub fn remove(&mut self, keys: &[&str]) {
        for key in keys {
            self.values.remove(*key);
        }
        self.version += 1;
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    fn missing(&self, key: &str, caller: &Location<'_>) -> CoreError {
        CoreError::MetadataKeyNotFound {
            key: key.to_string(),
            entity: self.entity,
            available: self.keys(),
            caller: caller.to_string(),
        }
    }
}

/// Recursively merge `incoming` into `target` without overwriting scalars.
fn deep_merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (key, value) in patch {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(items)) => existing.extend(items),
        (Value::Array(existing), item) => existing.push(item),
        // Scalars and mismatched shapes keep the stored value.
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
