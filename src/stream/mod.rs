//! Resumable output channels
//!
//! Every generation writes its events into an [`EventSink`], a broadcast
//! channel that any number of readers can attach to. Readers see events from
//! the moment they subscribe; nothing is replayed. The [`StreamContext`]
//! keeps the sinks of in-flight generations addressable by stream id so a
//! client that lost its connection can reattach from another request.
//!
//! Once a generation has finished its sink is gone. A reconnect that arrives
//! shortly afterwards is served a single synthesized `data-appendMessage`
//! event instead (see [`append_for_late_resume`]).

use crate::config::StreamConfig;
use crate::session::SessionEvent;
use crate::store::{DbMessage, MessageRole};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, broadcast};

/// Append-only handle onto one generation's output channel.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no readers attached is not an error; the
    /// generation keeps running for a later resume.
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = kind, "No subscribers attached to output channel");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Registry of live output channels keyed by stream id.
pub struct StreamContext {
    streams: RwLock<HashMap<String, EventSink>>,
    capacity: usize,
}

impl StreamContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Open a channel for a new generation attempt.
    pub fn create(&self, stream_id: &str) -> EventSink {
        let sink = EventSink::new(self.capacity);
        self.streams
            .write()
            .insert(stream_id.to_string(), sink.clone());
        tracing::debug!(stream_id, "Opened resumable stream");
        sink
    }

    /// Attach to a live stream, if it is still retained.
    pub fn resume(&self, stream_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.streams.read().get(stream_id).map(EventSink::subscribe)
    }

    /// Stop retaining a stream. Subscribers see the channel close once the
    /// producer drops its own sink.
    pub fn finish(&self, stream_id: &str) {
        if self.streams.write().remove(stream_id).is_some() {
            tracing::debug!(stream_id, "Released resumable stream");
        }
    }

    pub fn is_active(&self, stream_id: &str) -> bool {
        self.streams.read().contains_key(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.streams.read().len()
    }
}

static STREAM_CONTEXT: OnceCell<Option<Arc<StreamContext>>> = OnceCell::const_new();

/// Process-wide stream context, created on first use.
///
/// Concurrent first callers wait on the same initialization. The first
/// caller's config wins; later calls never reinitialize. `None` means
/// resumable streaming is disabled.
pub async fn stream_context(config: &StreamConfig) -> Option<Arc<StreamContext>> {
    STREAM_CONTEXT
        .get_or_init(|| async {
            if config.resumable {
                tracing::info!(capacity = config.capacity, "Resumable streams enabled");
                Some(Arc::new(StreamContext::new(config.capacity)))
            } else {
                tracing::info!("Resumable streams disabled");
                None
            }
        })
        .await
        .clone()
}

/// Decide what a reconnecting client gets once the live stream is gone.
///
/// Only an assistant message persisted no more than `window_secs` before
/// `now` is replayed, as one terminal append event.
pub fn append_for_late_resume(
    last: Option<&DbMessage>,
    now: DateTime<Utc>,
    window_secs: u64,
) -> Option<SessionEvent> {
    let message = last?;
    if message.role != MessageRole::Assistant {
        return None;
    }
    let elapsed_ms = now.signed_duration_since(message.created_at).num_milliseconds();
    let window_ms = i64::try_from(window_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    if elapsed_ms > window_ms {
        return None;
    }
    Some(SessionEvent::AppendMessage {
        data: message.clone(),
    })
}
