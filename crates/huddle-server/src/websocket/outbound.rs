//! Bounded per-connection outbound queue with the slow-consumer drop policy.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use huddle_core::events::{EventKind, PreparedEvent};
use huddle_core::protocol::ClientResponse;
use huddle_settings::WebSocketSettings;

/// One item waiting to be written.
#[derive(Debug)]
pub enum Outbound {
    /// A broadcast event; the write loop stamps its sequence number.
    Event(Arc<PreparedEvent>),
    /// A reply to a client request.
    Response(ClientResponse),
    /// Close the connection once everything queued before it is written.
    Close,
}

impl Outbound {
    /// Event kind, for events.
    pub fn kind(&self) -> Option<&EventKind> {
        match self {
            Self::Event(ev) => Some(ev.kind()),
            Self::Response(_) | Self::Close => None,
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted.
    Queued,
    /// Discarded by the slow-consumer policy.
    Dropped,
    /// The queue is at capacity.
    Full,
    /// The write loop is gone.
    Closed,
}

/// Which events may be discarded, and when.
#[derive(Clone, Debug)]
pub struct DropPolicy {
    droppable: HashSet<String>,
    slow_threshold: usize,
    full_threshold: usize,
}

impl DropPolicy {
    /// Build from websocket settings.
    pub fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            droppable: settings.droppable_events.iter().cloned().collect(),
            slow_threshold: settings.slow_threshold(),
            full_threshold: settings.full_threshold(),
        }
    }

    /// Whether events of `kind` are on the droppable list.
    pub fn is_droppable(&self, kind: &EventKind) -> bool {
        self.droppable.contains(kind.as_str())
    }

    /// Whether an item should be discarded at queue length `len`.
    pub fn should_drop(&self, item: &Outbound, len: usize) -> bool {
        len >= self.slow_threshold && item.kind().is_some_and(|k| self.is_droppable(k))
    }

    /// Length at which droppable events are discarded.
    pub fn slow_threshold(&self) -> usize {
        self.slow_threshold
    }

    /// Length at which the write loop warns.
    pub fn full_threshold(&self) -> usize {
        self.full_threshold
    }
}

/// Producer side of a connection's outbound queue.
pub struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    policy: DropPolicy,
}

impl OutboundQueue {
    /// Create a queue of `capacity` and return its consumer end.
    pub fn new(capacity: usize, policy: DropPolicy) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, policy }, rx)
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// The drop policy.
    pub fn policy(&self) -> &DropPolicy {
        &self.policy
    }

    /// Enqueue without waiting. Droppable events are discarded past the
    /// slow mark; nothing else is ever discarded here.
    pub fn try_push(&self, item: Outbound) -> EnqueueOutcome {
        if self.policy.should_drop(&item, self.len()) {
            return EnqueueOutcome::Dropped;
        }
        match self.tx.try_send(item) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }
}
