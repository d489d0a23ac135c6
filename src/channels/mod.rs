//! Channel algebra: the typed, versioned rendezvous between nodes.
//!
//! Channels are *value-oriented*: the scheduler never holds a mutable
//! channel across steps. Each superstep rebuilds every channel from the
//! prior checkpoint via its [`ChannelSpec`] factory, applies the step's
//! grouped writes with [`Channel::update`], then serializes the survivors
//! with [`Channel::checkpoint`]. Replay is therefore trivially
//! deterministic and checkpointing stays cheap.
//!
//! # Variants
//!
//! | Variant | Semantics |
//! |---|---|
//! | [`LastValue`] | single last value, at most one write per step |
//! | [`AnyValue`] | last of many writes, no error |
//! | [`EphemeralValue`] | visible only the step after the write |
//! | [`Topic`] | pub-sub list, optional dedup / accumulation |
//! | [`Aggregate`] | fold writes through a binary operator |
//! | [`NamedBarrier`] | waits for all named writers, then resets |
//! | [`DynamicBarrier`] | primed at runtime with the awaited names |
//!
//! # Examples
//!
//! ```rust
//! use serde_json::json;
//! use stepgraph::channels::ChannelSpec;
//!
//! let mut ch = ChannelSpec::last_value().build("msg", None)?;
//! assert!(!ch.is_available());
//! ch.update(vec![json!("hi")])?;
//! assert_eq!(ch.get()?, json!("hi"));
//! # Ok::<(), stepgraph::channels::ChannelError>(())
//! ```

pub mod aggregate;
pub mod barriers;
pub mod errors;
pub mod topic;
pub mod value;

use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde_json::Value;

pub use aggregate::{Aggregate, BinaryOperator, InitFn};
pub use barriers::{DynamicBarrier, NamedBarrier, WAIT_FOR_NAMES_KEY, wait_for_names};
pub use errors::ChannelError;
pub use topic::Topic;
pub use value::{AnyValue, EphemeralValue, LastValue};

/// Declarative factory for a channel.
///
/// Graphs register factories at build time; the runner instantiates a
/// fresh [`Channel`] from the factory (plus the checkpointed state, if
/// any) at the start of every superstep.
#[derive(Clone)]
pub enum ChannelSpec {
    LastValue,
    AnyValue,
    Ephemeral,
    Topic {
        unique: bool,
        accumulate: bool,
    },
    Aggregate {
        op: Arc<BinaryOperator>,
        init: Option<Arc<InitFn>>,
    },
    NamedBarrier {
        names: FxHashSet<String>,
        require_finish: bool,
    },
    DynamicBarrier,
}

impl std::fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelSpec::LastValue => f.write_str("LastValue"),
            ChannelSpec::AnyValue => f.write_str("AnyValue"),
            ChannelSpec::Ephemeral => f.write_str("Ephemeral"),
            ChannelSpec::Topic { unique, accumulate } => f
                .debug_struct("Topic")
                .field("unique", unique)
                .field("accumulate", accumulate)
                .finish(),
            ChannelSpec::Aggregate { .. } => f.write_str("Aggregate"),
            ChannelSpec::NamedBarrier {
                names,
                require_finish,
            } => f
                .debug_struct("NamedBarrier")
                .field("names", names)
                .field("require_finish", require_finish)
                .finish(),
            ChannelSpec::DynamicBarrier => f.write_str("DynamicBarrier"),
        }
    }
}

impl ChannelSpec {
    pub fn last_value() -> Self {
        ChannelSpec::LastValue
    }

    pub fn any_value() -> Self {
        ChannelSpec::AnyValue
    }

    pub fn ephemeral() -> Self {
        ChannelSpec::Ephemeral
    }

    pub fn topic(unique: bool, accumulate: bool) -> Self {
        ChannelSpec::Topic { unique, accumulate }
    }

    /// Fold channel without a seed; the first write initializes.
    pub fn aggregate<F>(op: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        ChannelSpec::Aggregate {
            op: Arc::new(op),
            init: None,
        }
    }

    /// Fold channel seeded from a factory; available from construction.
    pub fn aggregate_with<F, I>(op: F, init: I) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
        I: Fn() -> Value + Send + Sync + 'static,
    {
        ChannelSpec::Aggregate {
            op: Arc::new(op),
            init: Some(Arc::new(init)),
        }
    }

    pub fn named_barrier<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChannelSpec::NamedBarrier {
            names: names.into_iter().map(Into::into).collect(),
            require_finish: false,
        }
    }

    pub fn named_barrier_after_finish<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChannelSpec::NamedBarrier {
            names: names.into_iter().map(Into::into).collect(),
            require_finish: true,
        }
    }

    pub fn dynamic_barrier() -> Self {
        ChannelSpec::DynamicBarrier
    }

    /// Instantiate a channel, restoring `saved` state when present.
    ///
    /// This is the `fromCheckpoint` edge of the channel lifecycle; passing
    /// `None` yields the variant's pristine state.
    pub fn build(&self, name: &str, saved: Option<&Value>) -> Result<Channel, ChannelError> {
        Ok(match self {
            ChannelSpec::LastValue => Channel::LastValue(LastValue::new(name, saved)),
            ChannelSpec::AnyValue => Channel::AnyValue(AnyValue::new(name, saved)),
            ChannelSpec::Ephemeral => Channel::Ephemeral(EphemeralValue::new(name, saved)),
            ChannelSpec::Topic { unique, accumulate } => {
                Channel::Topic(Topic::new(name, *unique, *accumulate, saved)?)
            }
            ChannelSpec::Aggregate { op, init } => {
                Channel::Aggregate(Aggregate::new(name, op.clone(), init.clone(), saved))
            }
            ChannelSpec::NamedBarrier {
                names,
                require_finish,
            } => Channel::NamedBarrier(NamedBarrier::new(
                name,
                names.clone(),
                *require_finish,
                saved,
            )?),
            ChannelSpec::DynamicBarrier => Channel::DynamicBarrier(DynamicBarrier::new(name, saved)?),
        })
    }
}

/// A live channel instance for the current superstep.
///
/// Closed set of variants; the scheduler only ever talks to this enum, so
/// dispatch stays static and the capability surface cannot grow by
/// inheritance.
#[derive(Debug, Clone)]
pub enum Channel {
    LastValue(LastValue),
    AnyValue(AnyValue),
    Ephemeral(EphemeralValue),
    Topic(Topic),
    Aggregate(Aggregate),
    NamedBarrier(NamedBarrier),
    DynamicBarrier(DynamicBarrier),
}

impl Channel {
    /// Apply one step's grouped writes. Returns whether the channel mutated.
    ///
    /// The scheduler groups writes per channel and calls this exactly once
    /// per step; the variant decides ordering and arity semantics. An empty
    /// group is the commit pass over untouched channels and lets ephemeral
    /// values decay.
    pub fn update(&mut self, updates: Vec<Value>) -> Result<bool, ChannelError> {
        match self {
            Channel::LastValue(ch) => ch.update(updates),
            Channel::AnyValue(ch) => ch.update(updates),
            Channel::Ephemeral(ch) => ch.update(updates),
            Channel::Topic(ch) => ch.update(updates),
            Channel::Aggregate(ch) => ch.update(updates),
            Channel::NamedBarrier(ch) => ch.update(updates),
            Channel::DynamicBarrier(ch) => ch.update(updates),
        }
    }

    /// Current value, or [`ChannelError::EmptyChannel`] when unavailable.
    pub fn get(&self) -> Result<Value, ChannelError> {
        match self {
            Channel::LastValue(ch) => ch.get(),
            Channel::AnyValue(ch) => ch.get(),
            Channel::Ephemeral(ch) => ch.get(),
            Channel::Topic(ch) => ch.get(),
            Channel::Aggregate(ch) => ch.get(),
            Channel::NamedBarrier(ch) => ch.get(),
            Channel::DynamicBarrier(ch) => ch.get(),
        }
    }

    /// Serializable state for the next checkpoint.
    ///
    /// Fails with [`ChannelError::EmptyChannel`] when there is nothing worth
    /// persisting; the committer omits such channels from the snapshot.
    pub fn checkpoint(&self) -> Result<Value, ChannelError> {
        match self {
            Channel::LastValue(ch) => ch.get(),
            Channel::AnyValue(ch) => ch.get(),
            Channel::Ephemeral(ch) => ch.get(),
            Channel::Topic(ch) => ch.checkpoint(),
            Channel::Aggregate(ch) => ch.get(),
            Channel::NamedBarrier(ch) => ch.checkpoint(),
            Channel::DynamicBarrier(ch) => ch.checkpoint(),
        }
    }

    /// Mark the channel spent after it triggered a node this step.
    ///
    /// Barriers reset here; value channels ignore the call.
    pub fn consume(&mut self) -> bool {
        match self {
            Channel::NamedBarrier(ch) => ch.consume(),
            Channel::DynamicBarrier(ch) => ch.consume(),
            _ => false,
        }
    }

    /// Notify the channel that planning has run dry.
    ///
    /// Only `NamedBarrierAfterFinish`-style barriers react; a `true` return
    /// tells the runner to bump the version and plan one more round.
    pub fn finish(&mut self) -> bool {
        match self {
            Channel::NamedBarrier(ch) => ch.finish(),
            _ => false,
        }
    }

    /// Whether a read would succeed.
    pub fn is_available(&self) -> bool {
        match self {
            Channel::LastValue(ch) => ch.is_available(),
            Channel::AnyValue(ch) => ch.is_available(),
            Channel::Ephemeral(ch) => ch.is_available(),
            Channel::Topic(ch) => ch.is_available(),
            Channel::Aggregate(ch) => ch.is_available(),
            Channel::NamedBarrier(ch) => ch.is_available(),
            Channel::DynamicBarrier(ch) => ch.is_available(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Channel::LastValue(ch) => ch.name(),
            Channel::AnyValue(ch) => ch.name(),
            Channel::Ephemeral(ch) => ch.name(),
            Channel::Topic(ch) => ch.name(),
            Channel::Aggregate(ch) => ch.name(),
            Channel::NamedBarrier(ch) => ch.name(),
            Channel::DynamicBarrier(ch) => ch.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_value_rejects_second_write() {
        let mut ch = ChannelSpec::last_value().build("x", None).unwrap();
        let err = ch.update(vec![json!(1), json!(2)]).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidUpdate { .. }));
    }

    #[test]
    fn ephemeral_decays_on_empty_group() {
        let mut ch = ChannelSpec::ephemeral().build("x", None).unwrap();
        ch.update(vec![json!("once")]).unwrap();
        assert!(ch.is_available());
        assert!(ch.update(vec![]).unwrap());
        assert!(!ch.is_available());
    }

    #[test]
    fn aggregate_folds_in_arrival_order() {
        let mut ch = ChannelSpec::aggregate(|a, b| {
            json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
        })
        .build("sum", None)
        .unwrap();
        ch.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        assert_eq!(ch.get().unwrap(), json!(6));
    }
}
