//! Single-value channels: last-write, any-write, and ephemeral variants.

use serde_json::Value;

use super::errors::ChannelError;

/// Holds the single last value written in a step.
///
/// Rejects more than one write per step; this is the default rendezvous for
/// state fields owned by exactly one node at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastValue {
    name: String,
    value: Option<Value>,
}

impl LastValue {
    pub fn new(name: impl Into<String>, saved: Option<&Value>) -> Self {
        Self {
            name: name.into(),
            value: saved.cloned(),
        }
    }

    pub fn update(&mut self, mut updates: Vec<Value>) -> Result<bool, ChannelError> {
        match updates.len() {
            0 => Ok(false),
            1 => {
                self.value = updates.pop();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(
                &self.name,
                format!("at most one write per step, got {n}"),
            )),
        }
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        self.value
            .clone()
            .ok_or_else(|| ChannelError::empty(&self.name))
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Holds the last of possibly many writes in a step, without error.
///
/// Useful for scratch fields where concurrent writers are expected and the
/// survivor is arbitrary-but-deterministic (planner task order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyValue {
    name: String,
    value: Option<Value>,
}

impl AnyValue {
    pub fn new(name: impl Into<String>, saved: Option<&Value>) -> Self {
        Self {
            name: name.into(),
            value: saved.cloned(),
        }
    }

    pub fn update(&mut self, mut updates: Vec<Value>) -> Result<bool, ChannelError> {
        if updates.is_empty() {
            return Ok(false);
        }
        self.value = updates.pop();
        Ok(true)
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        self.value
            .clone()
            .ok_or_else(|| ChannelError::empty(&self.name))
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Holds a value only for the step immediately after it was written.
///
/// An empty update group (the commit pass over untouched channels) clears
/// the value; interrupts do not commit and therefore do not clear it. The
/// `branch:to:*` routing channels are built on this variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralValue {
    name: String,
    value: Option<Value>,
}

impl EphemeralValue {
    pub fn new(name: impl Into<String>, saved: Option<&Value>) -> Self {
        Self {
            name: name.into(),
            value: saved.cloned(),
        }
    }

    pub fn update(&mut self, mut updates: Vec<Value>) -> Result<bool, ChannelError> {
        match updates.len() {
            0 => Ok(self.value.take().is_some()),
            1 => {
                self.value = updates.pop();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(
                &self.name,
                format!("at most one write per step, got {n}"),
            )),
        }
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        self.value
            .clone()
            .ok_or_else(|| ChannelError::empty(&self.name))
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
