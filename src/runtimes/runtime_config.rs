//! Per-run configuration: thread identity, resume position, and limits.

use std::time::Duration;

use rustc_hash::FxHashMap;

/// Default maximum number of supersteps per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Default capacity of the stream buffer between runner and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 1024;

/// What happens to sibling tasks when one fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Let peers finish, persist their writes, then surface the failure.
    #[default]
    Collect,
    /// Cancel peers as soon as one task fails fatally.
    FailFast,
}

/// Configuration for one `invoke`/`stream` call.
///
/// `(thread_id, checkpoint_ns, checkpoint_id)` uniquely addresses a
/// snapshot; leaving `checkpoint_id` empty means "the latest in this
/// thread/namespace". Everything else tunes the runner.
///
/// # Examples
///
/// ```rust
/// use stepgraph::runtimes::RunConfig;
///
/// let config = RunConfig::for_thread("t1").with_recursion_limit(50);
/// assert_eq!(config.thread_id.as_deref(), Some("t1"));
/// assert_eq!(config.recursion_limit, 50);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// Execution scope; required whenever a checkpointer is configured.
    pub thread_id: Option<String>,
    /// Pipe-delimited namespace for subgraphs; empty at the top level.
    pub checkpoint_ns: String,
    /// Resume at a specific historical snapshot instead of the latest.
    pub checkpoint_id: Option<String>,
    /// Per-namespace parent checkpoint ids, maintained for subgraph runs.
    pub checkpoint_map: FxHashMap<String, String>,
    /// Maximum supersteps before the run fails with a recursion error.
    pub recursion_limit: usize,
    /// Deadline for a whole superstep; `None` disables it.
    pub step_timeout: Option<Duration>,
    /// Deadline for a single task; `None` disables it.
    pub task_timeout: Option<Duration>,
    /// Sibling behavior on task failure.
    pub error_policy: ErrorPolicy,
    /// Bounded capacity of the runner→consumer stream channel.
    pub stream_buffer: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            checkpoint_map: FxHashMap::default(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            step_timeout: None,
            task_timeout: None,
            error_policy: ErrorPolicy::default(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl RunConfig {
    /// Config scoped to a thread, everything else default.
    #[must_use]
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_checkpoint_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    #[must_use]
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    /// The same scope re-addressed at a specific checkpoint.
    #[must_use]
    pub fn at_checkpoint(&self, checkpoint_id: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.checkpoint_id = Some(checkpoint_id.into());
        config
    }

    /// The same scope with the checkpoint pin removed (latest wins).
    #[must_use]
    pub fn latest(&self) -> Self {
        let mut config = self.clone();
        config.checkpoint_id = None;
        config
    }
}
