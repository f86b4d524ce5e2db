//! Per-connection state shared between the pump and the hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use huddle_core::events::PreparedEvent;
use huddle_core::protocol::ClientResponse;
use huddle_core::session::Session;
use huddle_core::{ConnectionId, UserId};
use huddle_settings::WebSocketSettings;

use super::outbound::{DropPolicy, EnqueueOutcome, Outbound, OutboundQueue};
use super::session_state::SessionState;

/// Consumer ends handed to the pump that owns the socket.
pub struct ConnectionChannels {
    /// Events and replies, in enqueue order.
    pub outbound: mpsc::Receiver<Outbound>,
    /// Payloads of pings to answer with a pong.
    pub pongs: mpsc::UnboundedReceiver<Bytes>,
}

/// A live client connection.
pub struct WebConn {
    id: ConnectionId,
    state: SessionState,
    queue: OutboundQueue,
    pongs: mpsc::UnboundedSender<Bytes>,
    /// Cancelled to ask the pump to stop.
    end: CancellationToken,
    /// Cancelled once the pump has fully exited and torn down.
    finished: CancellationToken,
    torn_down: AtomicBool,
    teardowns: AtomicUsize,
    /// Next outbound sequence number.
    sequence: AtomicU64,
    dropped_events: AtomicU64,
    last_activity: Mutex<Instant>,
    connected_at: Instant,
    /// User this connection is indexed under in the hub.
    indexed_user: Mutex<Option<UserId>>,
}

impl WebConn {
    /// Create a connection and the receiving ends its pump consumes.
    pub fn new(
        session: Option<Session>,
        settings: &WebSocketSettings,
    ) -> (Arc<Self>, ConnectionChannels) {
        let (queue, outbound) =
            OutboundQueue::new(settings.send_queue_size, DropPolicy::from_settings(settings));
        let (pongs, pong_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            state: SessionState::new(session, settings.member_cache_ttl()),
            queue,
            pongs,
            end: CancellationToken::new(),
            finished: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            teardowns: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            last_activity: Mutex::new(now),
            connected_at: now,
            indexed_user: Mutex::new(None),
        });
        (
            conn,
            ConnectionChannels {
                outbound,
                pongs: pong_rx,
            },
        )
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Session and membership caches.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The outbound queue.
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// User of the cached session, if authenticated.
    pub fn user_id(&self) -> Option<UserId> {
        self.state.user_id()
    }

    /// Enqueue a broadcast event without waiting.
    pub fn send_event(&self, event: Arc<PreparedEvent>) -> EnqueueOutcome {
        let outcome = self.queue.try_push(Outbound::Event(event.clone()));
        if outcome == EnqueueOutcome::Dropped {
            self.record_drop(event.kind().as_str());
        }
        outcome
    }

    /// Enqueue a reply without waiting. A full queue closes the connection.
    pub fn send_response(&self, response: ClientResponse) -> EnqueueOutcome {
        let outcome = self.queue.try_push(Outbound::Response(response));
        if outcome == EnqueueOutcome::Full {
            self.close_on_full("response");
        }
        outcome
    }

    /// Close after a message could not be queued because the queue is full.
    pub(crate) fn close_on_full(&self, event_type: &str) {
        counter!("ws_queue_full_closes_total").increment(1);
        let user_id = self.user_id();
        warn!(
            conn_id = %self.id,
            user_id = user_id.as_ref().map_or("", UserId::as_str),
            event_type,
            "outbound queue full, closing connection"
        );
        self.shutdown();
    }

    /// Close once everything already queued has been written.
    pub fn close_after_flush(&self) {
        if self.queue.try_push(Outbound::Close) != EnqueueOutcome::Queued {
            self.shutdown();
        }
    }

    pub(crate) fn record_drop(&self, event_type: &str) {
        let _ = self.dropped_events.fetch_add(1, Ordering::Relaxed);
        counter!("ws_broadcast_drops_total", "event" => event_type.to_owned()).increment(1);
        debug!(conn_id = %self.id, event_type, "dropped event for slow connection");
    }

    /// Events discarded by the slow-consumer policy so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the pump to answer a ping.
    pub(crate) fn queue_pong(&self, payload: Bytes) {
        let _ = self.pongs.send(payload);
    }

    /// Claim the next outbound sequence number.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// The sequence number the next event will carry.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Record peer activity.
    pub fn mark_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Time since the connection was accepted.
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn set_indexed_user(&self, user_id: Option<UserId>) -> Option<UserId> {
        std::mem::replace(&mut *self.indexed_user.lock(), user_id)
    }

    pub(crate) fn indexed_user(&self) -> Option<UserId> {
        self.indexed_user.lock().clone()
    }

    /// Ask the pump to stop without waiting for it.
    pub fn shutdown(&self) {
        self.end.cancel();
    }

    /// Whether a stop was requested.
    pub fn is_closing(&self) -> bool {
        self.end.is_cancelled()
    }

    pub(crate) fn end_token(&self) -> &CancellationToken {
        &self.end
    }

    /// Stop the connection and wait until its pump has torn down.
    ///
    /// Safe to call any number of times, from any task other than the pump.
    pub async fn close(&self) {
        self.shutdown();
        self.finished.cancelled().await;
    }

    /// Wait for the pump to exit on its own.
    pub async fn closed(&self) {
        self.finished.cancelled().await;
    }

    /// Whether the pump has exited.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Run `teardown` exactly once, then release waiters in [`close`](Self::close).
    ///
    /// Returns `false` when a teardown already happened.
    pub(crate) fn finish(&self, teardown: impl FnOnce()) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.end.cancel();
        teardown();
        let _ = self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.finished.cancel();
        true
    }

    /// Number of teardowns executed (0 or 1).
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use huddle_core::events::{Event, EventKind};

    fn conn() -> (Arc<WebConn>, ConnectionChannels) {
        WebConn::new(None, &WebSocketSettings::default())
    }

    #[test]
    fn sequence_starts_at_zero() {
        let (c, _ch) = conn();
        assert_eq!(c.next_sequence(), 0);
        assert_eq!(c.next_sequence(), 1);
        assert_eq!(c.sequence(), 2);
    }

    #[test]
    fn finish_runs_teardown_once() {
        let (c, _ch) = conn();
        let mut runs = 0;
        assert!(c.finish(|| runs += 1));
        assert!(!c.finish(|| runs += 1));
        assert_eq!(runs, 1);
        assert_eq!(c.teardown_count(), 1);
        assert!(c.is_closing());
        assert!(c.is_finished());
    }

    #[tokio::test]
    async fn close_waits_for_finish() {
        let (c, _ch) = conn();
        let pump = c.clone();
        let handle = tokio::spawn(async move {
            pump.end_token().cancelled().await;
            let _ = pump.finish(|| {});
        });
        c.close().await;
        c.close().await;
        handle.await.unwrap();
        assert_eq!(c.teardown_count(), 1);
    }

    #[test]
    fn drop_counter_tracks_policy_drops() {
        let ws = WebSocketSettings {
            send_queue_size: 2,
            ..WebSocketSettings::default()
        };
        let (c, _ch) = WebConn::new(None, &ws);
        let typing = PreparedEvent::new(Event::to_all(EventKind::Typing)).unwrap();
        assert_eq!(c.send_event(typing.clone()), EnqueueOutcome::Queued);
        assert_eq!(c.send_event(typing), EnqueueOutcome::Dropped);
        assert_eq!(c.dropped_events(), 1);
    }

    #[test]
    fn reply_on_full_queue_closes() {
        let ws = WebSocketSettings {
            send_queue_size: 1,
            ..WebSocketSettings::default()
        };
        let (c, _ch) = WebConn::new(None, &ws);
        assert_eq!(c.send_response(ClientResponse::ok(1, None)), EnqueueOutcome::Queued);
        assert!(!c.is_closing());
        assert_eq!(c.send_response(ClientResponse::ok(2, None)), EnqueueOutcome::Full);
        assert!(c.is_closing());
    }

    #[tokio::test]
    async fn close_marker_follows_queued_items() {
        let (c, mut ch) = conn();
        let _ = c.send_response(ClientResponse::ok(1, None));
        c.close_after_flush();
        assert!(!c.is_closing());
        assert_matches!(ch.outbound.recv().await, Some(Outbound::Response(_)));
        assert_matches!(ch.outbound.recv().await, Some(Outbound::Close));
    }

    #[test]
    fn close_marker_on_full_queue_closes_now() {
        let ws = WebSocketSettings {
            send_queue_size: 1,
            ..WebSocketSettings::default()
        };
        let (c, _ch) = WebConn::new(None, &ws);
        let _ = c.send_response(ClientResponse::ok(1, None));
        c.close_after_flush();
        assert!(c.is_closing());
    }

    #[tokio::test]
    async fn pongs_reach_the_pump() {
        let (c, mut ch) = conn();
        c.queue_pong(Bytes::from_static(b"p"));
        assert_eq!(ch.pongs.recv().await.unwrap(), Bytes::from_static(b"p"));
    }

    #[test]
    fn indexed_user_replace() {
        let (c, _ch) = conn();
        assert!(c.set_indexed_user(Some("u1".into())).is_none());
        assert_eq!(c.indexed_user().unwrap().as_str(), "u1");
        assert_eq!(c.set_indexed_user(None).unwrap().as_str(), "u1");
    }
}
