//! Fold channel: reduces grouped writes through a binary operator.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::errors::ChannelError;

/// Binary operator folding the current value with one update.
pub type BinaryOperator = dyn Fn(Value, Value) -> Value + Send + Sync;

/// Factory producing the seed value for a fresh aggregate.
pub type InitFn = dyn Fn() -> Value + Send + Sync;

/// Folds every write through `op` in arrival order.
///
/// With an init factory the channel is available from construction; without
/// one, the first write initializes the value and the remainder fold.
#[derive(Clone)]
pub struct Aggregate {
    name: String,
    op: Arc<BinaryOperator>,
    value: Option<Value>,
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Aggregate {
    pub fn new(
        name: impl Into<String>,
        op: Arc<BinaryOperator>,
        init: Option<Arc<InitFn>>,
        saved: Option<&Value>,
    ) -> Self {
        let value = match saved {
            Some(saved) => Some(saved.clone()),
            None => init.as_ref().map(|f| f()),
        };
        Self {
            name: name.into(),
            op,
            value,
        }
    }

    pub fn update(&mut self, updates: Vec<Value>) -> Result<bool, ChannelError> {
        if updates.is_empty() {
            return Ok(false);
        }
        let mut acc = self.value.take();
        for update in updates {
            acc = Some(match acc {
                None => update,
                Some(current) => (self.op)(current, update),
            });
        }
        self.value = acc;
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
