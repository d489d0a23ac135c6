//! Streaming layer: per-superstep chunks over a bounded channel.
//!
//! The runner is the producer; the caller consumes a [`RunStream`]. Chunks
//! are labeled with a [`StreamMode`] and the namespace path of the graph
//! that emitted them (empty at the top level, one segment per subgraph
//! level below).
//!
//! Backpressure is bounded: runner-level emissions (`values`, `updates`,
//! `debug`) await channel capacity, so a slow consumer pauses the step at
//! the next emission point. Mid-task emissions (`custom`, `messages`) never
//! block; when the buffer is full they are dropped and counted, the same
//! accounting a lagging event subscriber gets.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::runtimes::runner::RunnerError;

/// What a stream subscription carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamMode {
    /// Full channel view once per step, after commit.
    Values,
    /// Per-node delta once per node per step, before commit.
    Updates,
    /// Token-level chunks emitted mid-task by nodes.
    Messages,
    /// User-defined chunks emitted mid-task by nodes.
    Custom,
    /// Task-level lifecycle events.
    Debug,
    /// Flattened event log mirroring every other emission, with names.
    Events,
}

impl StreamMode {
    fn label(self) -> &'static str {
        match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Messages => "messages",
            StreamMode::Custom => "custom",
            StreamMode::Debug => "debug",
            StreamMode::Events => "events",
        }
    }
}

/// Subscription options for [`crate::pregel::Pregel::stream`].
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Modes to receive. Empty defaults to `values`.
    pub modes: Vec<StreamMode>,
    /// Forward chunks from embedded subgraphs, namespaced.
    pub subgraphs: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            modes: vec![StreamMode::Values],
            subgraphs: false,
        }
    }
}

impl StreamOptions {
    pub fn modes<I: IntoIterator<Item = StreamMode>>(modes: I) -> Self {
        Self {
            modes: modes.into_iter().collect(),
            subgraphs: false,
        }
    }

    #[must_use]
    pub fn with_subgraphs(mut self) -> Self {
        self.subgraphs = true;
        self
    }
}

/// One emission from the runner.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamChunk {
    /// Subgraph path that produced the chunk; empty at the top level.
    pub namespace: Vec<String>,
    pub mode: StreamMode,
    pub payload: Value,
}

type StreamItem = Result<StreamChunk, RunnerError>;

struct EmitterInner {
    tx: flume::Sender<StreamItem>,
    modes: Vec<StreamMode>,
    subgraphs: bool,
    namespace: Vec<String>,
    dropped: AtomicUsize,
}

/// Producer-side handle for stream chunks.
///
/// Cheap to clone; a disabled emitter (the `invoke` path) turns every
/// emission into a no-op.
#[derive(Clone)]
pub struct StreamEmitter {
    inner: Option<Arc<EmitterInner>>,
}

impl std::fmt::Debug for StreamEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("StreamEmitter")
                .field("modes", &inner.modes)
                .field("namespace", &inner.namespace)
                .finish_non_exhaustive(),
            None => f.write_str("StreamEmitter(disabled)"),
        }
    }
}

impl StreamEmitter {
    /// Emitter that drops everything; used by `invoke`.
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub(crate) fn new(tx: flume::Sender<StreamItem>, options: &StreamOptions) -> Self {
        let modes = if options.modes.is_empty() {
            vec![StreamMode::Values]
        } else {
            options.modes.clone()
        };
        Self {
            inner: Some(Arc::new(EmitterInner {
                tx,
                modes,
                subgraphs: options.subgraphs,
                namespace: Vec::new(),
                dropped: AtomicUsize::new(0),
            })),
        }
    }

    /// Emitter for a subgraph one level below, or a disabled one when
    /// subgraph forwarding was not requested.
    #[must_use]
    pub(crate) fn child(&self, segment: &str) -> Self {
        match &self.inner {
            Some(inner) if inner.subgraphs => {
                let mut namespace = inner.namespace.clone();
                namespace.push(segment.to_string());
                Self {
                    inner: Some(Arc::new(EmitterInner {
                        tx: inner.tx.clone(),
                        modes: inner.modes.clone(),
                        subgraphs: true,
                        namespace,
                        dropped: AtomicUsize::new(0),
                    })),
                }
            }
            _ => Self::disabled(),
        }
    }

    /// Number of mid-task chunks dropped because the consumer lagged.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.dropped.load(Ordering::Relaxed))
    }

    /// Blocking emission point. A closed consumer reads as cancellation.
    pub(crate) async fn emit(&self, mode: StreamMode, payload: Value) -> Result<(), StreamClosed> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if inner.modes.contains(&mode) {
            let chunk = StreamChunk {
                namespace: inner.namespace.clone(),
                mode,
                payload: payload.clone(),
            };
            inner.tx.send_async(Ok(chunk)).await.map_err(|_| StreamClosed)?;
        }
        self.mirror_event(mode, payload).await
    }

    /// Non-blocking emission for mid-task chunks.
    pub(crate) fn try_emit(&self, mode: StreamMode, payload: Value) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mirror = inner.modes.contains(&StreamMode::Events);
        if inner.modes.contains(&mode) {
            let chunk = StreamChunk {
                namespace: inner.namespace.clone(),
                mode,
                payload: payload.clone(),
            };
            if inner.tx.try_send(Ok(chunk)).is_err() {
                let total = inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    target: "stepgraph::stream",
                    mode = mode.label(),
                    total_dropped = total,
                    "stream consumer lagged; dropped mid-task chunk"
                );
                return;
            }
        }
        if mirror {
            let event = StreamChunk {
                namespace: inner.namespace.clone(),
                mode: StreamMode::Events,
                payload: json!({ "name": mode.label(), "data": payload }),
            };
            let _ = inner.tx.try_send(Ok(event));
        }
    }

    pub(crate) fn emit_custom(&self, node: &str, payload: Value) {
        self.try_emit(StreamMode::Custom, json!({ "node": node, "payload": payload }));
    }

    pub(crate) fn emit_message(&self, node: &str, payload: Value) {
        self.try_emit(StreamMode::Messages, json!({ "node": node, "payload": payload }));
    }

    pub(crate) async fn fail(&self, error: RunnerError) {
        if let Some(inner) = &self.inner {
            let _ = inner.tx.send_async(Err(error)).await;
        }
    }

    async fn mirror_event(&self, mode: StreamMode, payload: Value) -> Result<(), StreamClosed> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if mode != StreamMode::Events && inner.modes.contains(&StreamMode::Events) {
            let event = StreamChunk {
                namespace: inner.namespace.clone(),
                mode: StreamMode::Events,
                payload: json!({ "name": mode.label(), "data": payload }),
            };
            inner.tx.send_async(Ok(event)).await.map_err(|_| StreamClosed)?;
        }
        Ok(())
    }
}

/// The consumer went away; the runner should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

/// Consumer side of a streaming run.
///
/// Yields `Ok(chunk)` per emission and at most one terminal `Err` when the
/// run fails. Dropping the stream cancels the run at its next emission
/// point; writes already persisted as pending survive for resume.
pub struct RunStream {
    rx: flume::r#async::RecvStream<'static, StreamItem>,
    cancel: watch::Sender<bool>,
}

impl RunStream {
    pub(crate) fn new(rx: flume::Receiver<StreamItem>, cancel: watch::Sender<bool>) -> Self {
        Self {
            rx: rx.into_stream(),
            cancel,
        }
    }

    /// Next chunk, or `None` once the run has wound down.
    pub async fn next(&mut self) -> Option<StreamItem> {
        futures_util::StreamExt::next(self).await
    }

    /// Cancel the run without waiting for it to finish.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

impl Stream for RunStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}
