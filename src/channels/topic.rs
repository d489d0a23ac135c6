//! Pub-sub list channel with optional dedup and cross-step accumulation.

use rustc_hash::FxHashSet;
use serde_json::{Value, json};

use super::errors::ChannelError;

/// A list of values published by any number of writers.
///
/// Nested arrays in an update group are flattened one level, so a node may
/// emit either a single item or a batch. With `unique`, structurally equal
/// values inside the visible window are dropped; with `accumulate`, the
/// window spans the whole run instead of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
    unique: bool,
    accumulate: bool,
    seen: FxHashSet<String>,
    values: Vec<Value>,
}

fn structural_key(value: &Value) -> String {
    // serde_json serializes maps in insertion order; good enough as a
    // dedup key since equal payloads are built the same way.
    value.to_string()
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        unique: bool,
        accumulate: bool,
        saved: Option<&Value>,
    ) -> Result<Self, ChannelError> {
        let name = name.into();
        let mut topic = Self {
            name,
            unique,
            accumulate,
            seen: FxHashSet::default(),
            values: Vec::new(),
        };
        if let Some(saved) = saved {
            let values = saved
                .get("values")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| {
                    ChannelError::invalid_update(&topic.name, "malformed topic checkpoint")
                })?;
            if topic.unique {
                topic.seen = values.iter().map(structural_key).collect();
            }
            topic.values = values;
        }
        Ok(topic)
    }

    pub fn update(&mut self, updates: Vec<Value>) -> Result<bool, ChannelError> {
        let mut incoming: Vec<Value> = Vec::new();
        for update in updates {
            match update {
                Value::Array(items) => incoming.extend(items),
                other => incoming.push(other),
            }
        }
        if self.unique {
            if self.accumulate {
                incoming.retain(|v| self.seen.insert(structural_key(v)));
            } else {
                // The visible window is one step; dedup within it only.
                let mut fresh = FxHashSet::default();
                incoming.retain(|v| fresh.insert(structural_key(v)));
                self.seen = fresh;
            }
        }

        if self.accumulate {
            let changed = !incoming.is_empty();
            self.values.extend(incoming);
            Ok(changed)
        } else {
            let changed = !incoming.is_empty() || !self.values.is_empty();
            self.values = incoming;
            Ok(changed)
        }
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        if self.values.is_empty() {
            return Err(ChannelError::empty(&self.name));
        }
        Ok(Value::Array(self.values.clone()))
    }

    pub fn checkpoint(&self) -> Result<Value, ChannelError> {
        if self.values.is_empty() {
            return Err(ChannelError::empty(&self.name));
        }
        Ok(json!({ "values": self.values }))
    }

    pub fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
