//! Barrier channels: fan-in coordination across named writers.

use rustc_hash::FxHashSet;
use serde_json::{Value, json};

use super::errors::ChannelError;

/// Key of the priming packet accepted by [`DynamicBarrier`].
pub const WAIT_FOR_NAMES_KEY: &str = "__wait_for_names__";

/// Build the priming packet that arms a [`DynamicBarrier`] with `names`.
pub fn wait_for_names<I, S>(names: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names: Vec<String> = names.into_iter().map(Into::into).collect();
    json!({ WAIT_FOR_NAMES_KEY: names })
}

fn parse_wait_for_names(value: &Value) -> Option<FxHashSet<String>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let names = obj.get(WAIT_FOR_NAMES_KEY)?.as_array()?;
    names
        .iter()
        .map(|n| n.as_str().map(str::to_string))
        .collect()
}

fn expect_name(channel: &str, value: &Value) -> Result<String, ChannelError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ChannelError::invalid_update(channel, "barrier writes must be node names"))
}

fn sorted(names: &FxHashSet<String>) -> Vec<&String> {
    let mut v: Vec<&String> = names.iter().collect();
    v.sort();
    v
}

/// Waits until every declared name has written, then reads as available.
///
/// `consume` resets the barrier for the next round. With `require_finish`
/// the barrier additionally waits for an explicit `finish()` call, which the
/// runner issues once planning runs dry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBarrier {
    name: String,
    names: FxHashSet<String>,
    seen: FxHashSet<String>,
    require_finish: bool,
    finished: bool,
}

impl NamedBarrier {
    pub fn new(
        name: impl Into<String>,
        names: FxHashSet<String>,
        require_finish: bool,
        saved: Option<&Value>,
    ) -> Result<Self, ChannelError> {
        let name = name.into();
        let mut barrier = Self {
            name,
            names,
            seen: FxHashSet::default(),
            require_finish,
            finished: false,
        };
        if let Some(saved) = saved {
            let seen = saved
                .get("seen")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ChannelError::invalid_update(&barrier.name, "malformed barrier checkpoint")
                })?;
            barrier.seen = seen
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            barrier.finished = saved
                .get("finished")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        Ok(barrier)
    }

    pub fn update(&mut self, updates: Vec<Value>) -> Result<bool, ChannelError> {
        let mut changed = false;
        for update in updates {
            let writer = expect_name(&self.name, &update)?;
            if !self.names.contains(&writer) {
                return Err(ChannelError::invalid_update(
                    &self.name,
                    format!("`{writer}` is not a declared barrier participant"),
                ));
            }
            // Idempotent per writer within and across steps.
            changed |= self.seen.insert(writer);
        }
        Ok(changed)
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        if self.is_available() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::empty(&self.name))
        }
    }

    pub fn checkpoint(&self) -> Result<Value, ChannelError> {
        if self.seen.is_empty() && !self.finished {
            return Err(ChannelError::empty(&self.name));
        }
        Ok(json!({ "seen": sorted(&self.seen), "finished": self.finished }))
    }

    pub fn is_available(&self) -> bool {
        self.seen == self.names && (!self.require_finish || self.finished)
    }

    pub fn consume(&mut self) -> bool {
        if self.seen == self.names {
            self.seen.clear();
            self.finished = false;
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self) -> bool {
        if self.require_finish && !self.finished {
            self.finished = true;
            true
        } else {
            false
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Two-state barrier: primed by a [`wait_for_names`] packet, then collects
/// the named values like [`NamedBarrier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicBarrier {
    name: String,
    names: Option<FxHashSet<String>>,
    seen: FxHashSet<String>,
}

impl DynamicBarrier {
    pub fn new(name: impl Into<String>, saved: Option<&Value>) -> Result<Self, ChannelError> {
        let name = name.into();
        let mut barrier = Self {
            name,
            names: None,
            seen: FxHashSet::default(),
        };
        if let Some(saved) = saved {
            barrier.names = saved.get("names").and_then(Value::as_array).map(|names| {
                names
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            });
            if let Some(seen) = saved.get("seen").and_then(Value::as_array) {
                barrier.seen = seen
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
        Ok(barrier)
    }

    pub fn update(&mut self, updates: Vec<Value>) -> Result<bool, ChannelError> {
        if updates.is_empty() {
            return Ok(false);
        }
        if let Some(names) = parse_wait_for_names(&updates[0]) {
            if updates.len() > 1 {
                return Err(ChannelError::invalid_update(
                    &self.name,
                    "a priming packet must be the only write in its step",
                ));
            }
            self.names = Some(names);
            self.seen.clear();
            return Ok(true);
        }

        let Some(names) = &self.names else {
            return Err(ChannelError::invalid_update(
                &self.name,
                "barrier is not primed; send a wait-for-names packet first",
            ));
        };
        let mut changed = false;
        for update in updates {
            let writer = expect_name(&self.name, &update)?;
            if !names.contains(&writer) {
                return Err(ChannelError::invalid_update(
                    &self.name,
                    format!("`{writer}` is not among the awaited names"),
                ));
            }
            changed |= self.seen.insert(writer);
        }
        Ok(changed)
    }

    pub fn get(&self) -> Result<Value, ChannelError> {
        if self.is_available() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::empty(&self.name))
        }
    }

    pub fn checkpoint(&self) -> Result<Value, ChannelError> {
        if self.names.is_none() && self.seen.is_empty() {
            return Err(ChannelError::empty(&self.name));
        }
        let names = self.names.as_ref().map(sorted);
        Ok(json!({ "names": names, "seen": sorted(&self.seen) }))
    }

    pub fn is_available(&self) -> bool {
        matches!(&self.names, Some(names) if *names == self.seen)
    }

    pub fn consume(&mut self) -> bool {
        if self.is_available() {
            self.names = None;
            self.seen.clear();
            true
        } else {
            false
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
