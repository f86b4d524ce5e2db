//! Lifecycle hooks around push delivery.

use huddle_core::{ChannelId, PostId, UserId};

use crate::wire::PushMessage;

/// Observes push tasks as they move through the hub.
///
/// Every hook has a no-op default. Hooks run on the worker task and must not
/// block.
pub trait PushObserver: Send + Sync {
    /// A task was accepted by the hub.
    fn enqueued(
        &self,
        _notification_id: &str,
        _kind: &str,
        _user_id: &UserId,
        _channel_id: &ChannelId,
        _post_id: Option<&PostId>,
    ) {
    }

    /// A device payload is about to be posted. Return `None` to suppress it,
    /// or a (possibly rewritten) message to send.
    fn will_be_sent(&self, msg: PushMessage) -> Option<PushMessage> {
        Some(msg)
    }

    /// The relay accepted a payload.
    fn has_been_sent(&self, _msg: &PushMessage) {}

    /// A payload failed (transport error, `REMOVE`, or `FAIL`).
    fn has_failed(&self, _msg: &PushMessage, _reason: &str) {}
}

/// Observer that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl PushObserver for NoopObserver {}
