use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_core::{kinds, ConnectionId, EventEnvelope, EventSource, SourceError};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

type Item = Result<EventEnvelope, SourceError>;

/// Event queue shared by every [`crate::MemoryConnection`] of a connector.
///
/// Once invalidated, every later wait fails with [`SourceError::Invalidated`].
#[derive(Debug)]
pub struct MemoryEventSource {
    tx: mpsc::UnboundedSender<Item>,
    rx: Mutex<mpsc::UnboundedReceiver<Item>>,
    invalidated: AtomicBool,
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn push(&self, envelope: EventEnvelope) {
        debug!(target: "memory", kind = %envelope.kind, channel = %envelope.channel, "Queueing event");
        let _ = self.tx.send(Ok(envelope));
    }

    /// Queues an event for `connection_id`.
    pub fn emit(&self, connection_id: ConnectionId, channel: &str, kind: &str, payload: Value) {
        self.push(EventEnvelope::new(kind, channel, Some(connection_id), payload));
    }

    /// Queues the per-connection disconnect control event.
    pub fn emit_disconnected(&self, connection_id: ConnectionId) {
        self.push(EventEnvelope::control(kinds::DISCONNECTED, Some(connection_id)));
    }

    /// Makes the next wait fail with a retryable error.
    pub fn push_failure(&self, message: impl Into<String>) {
        let _ = self.tx.send(Err(SourceError::Transient(message.into())));
    }

    /// Terminally invalidates the queue, waking a pending waiter.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        let _ = self.tx.send(Err(SourceError::Invalidated));
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn wait_event(&self) -> Result<EventEnvelope, SourceError> {
        if self.is_invalidated() {
            return Err(SourceError::Invalidated);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(item) => item,
            None => Err(SourceError::Invalidated),
        }
    }

    fn emit_break(&self, generation: u64) -> Result<(), SourceError> {
        if self.is_invalidated() {
            return Err(SourceError::Invalidated);
        }
        self.tx
            .send(Ok(EventEnvelope::break_for(generation)))
            .map_err(|_| SourceError::Invalidated)
    }
}
