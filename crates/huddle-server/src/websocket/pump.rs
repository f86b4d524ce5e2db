//! Socket pumps: move frames between a transport and a [`WebConn`].
//!
//! Two strategies share the same read and write steps:
//!
//! - **Evented**: one task selects over inbound frames, the outbound queue,
//!   and the timers. Inbound dispatch takes a permit from the hub's
//!   server-wide read semaphore.
//! - **Blocking**: a dedicated writer task drains the queue while the pump
//!   task runs the read loop; when reading ends the writer is stopped and
//!   awaited before teardown.
//!
//! Either way the connection is torn down exactly once, after both
//! directions have stopped.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout};
use tracing::{Instrument, debug, instrument, warn};

use huddle_core::ChannelId;
use huddle_core::protocol::{AppError, ClientRequest, ClientResponse, ERR_BAD_JSON, ERR_TOO_LARGE};
use huddle_settings::{IoMode, WebSocketSettings};

use super::connection::{ConnectionChannels, WebConn};
use super::hub::Hub;
use super::outbound::Outbound;
use super::transport::{Frame, FrameSink, FrameStream, Transport, TransportError};

/// How a connection's socket is driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStrategy {
    /// One task multiplexing both directions.
    Evented,
    /// A read loop plus a dedicated writer task.
    Blocking,
}

impl PumpStrategy {
    /// Resolve the configured mode. `auto` is evented on Unix without TLS.
    pub fn select(mode: IoMode, tls: bool) -> Self {
        match mode {
            IoMode::Evented => Self::Evented,
            IoMode::Blocking => Self::Blocking,
            IoMode::Auto if !tls && cfg!(unix) => Self::Evented,
            IoMode::Auto => Self::Blocking,
        }
    }
}

/// Start pumping `transport` for `conn`.
pub(crate) fn spawn(
    strategy: PumpStrategy,
    conn: Arc<WebConn>,
    hub: Arc<Hub>,
    transport: Transport,
    channels: ConnectionChannels,
) -> JoinHandle<()> {
    tokio::spawn(run(strategy, conn, hub, transport, channels))
}

#[instrument(skip_all, fields(conn_id = %conn.id(), mode = ?strategy))]
async fn run(
    strategy: PumpStrategy,
    conn: Arc<WebConn>,
    hub: Arc<Hub>,
    transport: Transport,
    channels: ConnectionChannels,
) {
    let Transport { sink, stream } = transport;
    let writer = WriteSide::new(sink, channels, hub.settings());

    let writer = match strategy {
        PumpStrategy::Evented => Some(run_evented(&conn, &hub, writer, stream).await),
        PumpStrategy::Blocking => run_blocking(&conn, &hub, writer, stream).await,
    };
    if let Some(writer) = writer {
        writer.close().await;
    }

    let _ = conn.finish(|| {
        let _ = hub.unregister(&conn);
    });
    debug!(
        dropped = conn.dropped_events(),
        sent = conn.sequence(),
        "websocket pump stopped"
    );
}

async fn run_evented(
    conn: &Arc<WebConn>,
    hub: &Arc<Hub>,
    mut ws: WriteSide,
    mut stream: FrameStream,
) -> WriteSide {
    let end = conn.end_token().clone();
    let mut reader = ReadDeadline::new(hub.settings().pong_wait());

    loop {
        tokio::select! {
            biased;
            () = end.cancelled() => break,
            item = ws.channels.outbound.recv() => {
                let Some(item) = item else { break };
                match ws.write_outbound(conn, item).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break,
                    Err(e) => {
                        log_socket_error("write", &e);
                        break;
                    }
                }
            }
            Some(payload) = ws.channels.pongs.recv() => {
                if let Err(e) = ws.write(Frame::Pong(payload)).await {
                    log_socket_error("pong", &e);
                    break;
                }
            }
            _ = ws.ping.tick() => {
                if let Err(e) = ws.write(Frame::Ping(Bytes::new())).await {
                    log_socket_error("ping", &e);
                    break;
                }
            }
            () = &mut ws.auth_grace, if ws.auth_pending => {
                ws.auth_pending = false;
                if !auth_grace_passed(conn) {
                    break;
                }
            }
            () = &mut reader.deadline => {
                debug!("read deadline expired");
                break;
            }
            frame = stream.next() => {
                let Some(frame) = next_frame(frame) else { break };
                let Ok(_permit) = hub.read_permits().acquire().await else { break };
                if reader.on_frame(conn, hub, frame).await == Flow::Stop {
                    break;
                }
            }
        }
    }
    ws
}

async fn run_blocking(
    conn: &Arc<WebConn>,
    hub: &Arc<Hub>,
    ws: WriteSide,
    stream: FrameStream,
) -> Option<WriteSide> {
    let writer = tokio::spawn(write_loop(conn.clone(), ws).in_current_span());
    read_loop(conn, hub, stream).await;
    conn.shutdown();
    match writer.await {
        Ok(ws) => Some(ws),
        Err(e) => {
            warn!(error = %e, "websocket writer task failed");
            None
        }
    }
}

/// Writer task of the blocking strategy. Returns the sink for the final close.
async fn write_loop(conn: Arc<WebConn>, mut ws: WriteSide) -> WriteSide {
    let end = conn.end_token().clone();
    loop {
        tokio::select! {
            biased;
            () = end.cancelled() => break,
            item = ws.channels.outbound.recv() => {
                let Some(item) = item else { break };
                match ws.write_outbound(&conn, item).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break,
                    Err(e) => {
                        log_socket_error("write", &e);
                        break;
                    }
                }
            }
            Some(payload) = ws.channels.pongs.recv() => {
                if let Err(e) = ws.write(Frame::Pong(payload)).await {
                    log_socket_error("pong", &e);
                    break;
                }
            }
            _ = ws.ping.tick() => {
                if let Err(e) = ws.write(Frame::Ping(Bytes::new())).await {
                    log_socket_error("ping", &e);
                    break;
                }
            }
            () = &mut ws.auth_grace, if ws.auth_pending => {
                ws.auth_pending = false;
                if !auth_grace_passed(&conn) {
                    break;
                }
            }
        }
    }
    // A failed write must also stop the read side.
    conn.shutdown();
    ws
}

async fn read_loop(conn: &Arc<WebConn>, hub: &Arc<Hub>, mut stream: FrameStream) {
    let end = conn.end_token().clone();
    let mut reader = ReadDeadline::new(hub.settings().pong_wait());
    loop {
        tokio::select! {
            biased;
            () = end.cancelled() => break,
            () = &mut reader.deadline => {
                debug!("read deadline expired");
                break;
            }
            frame = stream.next() => {
                let Some(frame) = next_frame(frame) else { break };
                if reader.on_frame(conn, hub, frame).await == Flow::Stop {
                    break;
                }
            }
        }
    }
}

fn next_frame(frame: Option<Result<Frame, TransportError>>) -> Option<Frame> {
    match frame {
        Some(Ok(frame)) => Some(frame),
        Some(Err(e)) => {
            log_socket_error("read", &e);
            None
        }
        None => {
            debug!("peer closed the stream");
            None
        }
    }
}

/// Whether an unauthenticated connection may stay once the grace period ends.
fn auth_grace_passed(conn: &WebConn) -> bool {
    if conn.state().token().is_empty() {
        debug!("no authentication within grace period, closing");
        return false;
    }
    true
}

fn log_socket_error(op: &'static str, error: &TransportError) {
    match error {
        TransportError::Closed => debug!(op, "socket closed"),
        TransportError::WriteTimeout => warn!(op, "socket write timed out"),
        TransportError::Io(e) => debug!(op, error = %e, "socket error"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write side
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the write direction owns.
struct WriteSide {
    sink: FrameSink,
    channels: ConnectionChannels,
    write_wait: Duration,
    ping: Interval,
    auth_grace: Pin<Box<Sleep>>,
    auth_pending: bool,
}

impl WriteSide {
    fn new(sink: FrameSink, channels: ConnectionChannels, settings: &WebSocketSettings) -> Self {
        let period = settings.ping_interval();
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            sink,
            channels,
            write_wait: settings.write_wait(),
            ping,
            auth_grace: Box::pin(sleep(settings.auth_grace())),
            auth_pending: true,
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        match timeout(self.write_wait, self.sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    /// Write one queued item, applying the slow-consumer policy first.
    /// A close marker stops the loop.
    async fn write_outbound(&mut self, conn: &WebConn, item: Outbound) -> Result<Flow, TransportError> {
        let remaining = conn.queue().len();
        let policy = conn.queue().policy();

        if policy.should_drop(&item, remaining) {
            if let Some(kind) = item.kind() {
                warn!(
                    user_id = user_label(conn).as_str(),
                    event_type = %kind,
                    queue_len = remaining,
                    "slow connection, dropping event"
                );
                conn.record_drop(kind.as_str());
            }
            return Ok(Flow::Continue);
        }

        let (text, event_type, channel_id) = match &item {
            Outbound::Event(ev) => (
                ev.encode(conn.next_sequence()),
                Some(ev.kind().as_str()),
                ev.event().broadcast().channel_id.as_ref().map_or("", ChannelId::as_str),
            ),
            Outbound::Response(resp) => match serde_json::to_string(resp) {
                Ok(text) => (text, None, ""),
                Err(e) => {
                    warn!(error = %e, "failed to encode reply");
                    return Ok(Flow::Continue);
                }
            },
            Outbound::Close => {
                debug!("closing after queued writes");
                return Ok(Flow::Stop);
            }
        };

        let size = text.len();
        if remaining >= policy.full_threshold() {
            warn!(
                user_id = user_label(conn).as_str(),
                event_type = event_type.unwrap_or("response"),
                channel_id,
                size,
                queue_len = remaining,
                capacity = conn.queue().capacity(),
                "outbound queue nearly full"
            );
        }

        self.write(Frame::Text(text)).await?;
        if let Some(event_type) = event_type {
            counter!("ws_broadcast_total", "event" => event_type.to_owned()).increment(1);
        }
        debug!(size, "frame written");
        Ok(Flow::Continue)
    }

    /// Best-effort close frame.
    async fn close(mut self) {
        let write_wait = self.write_wait;
        let _ = timeout(write_wait, async {
            let _ = self.sink.send(Frame::Close).await;
            let _ = self.sink.close().await;
        })
        .await;
    }
}

fn user_label(conn: &WebConn) -> String {
    conn.user_id().map(String::from).unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Read side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Read deadline, pushed back by every pong.
struct ReadDeadline {
    deadline: Pin<Box<Sleep>>,
    pong_wait: Duration,
}

impl ReadDeadline {
    fn new(pong_wait: Duration) -> Self {
        Self {
            deadline: Box::pin(sleep(pong_wait)),
            pong_wait,
        }
    }

    async fn on_frame(&mut self, conn: &Arc<WebConn>, hub: &Arc<Hub>, frame: Frame) -> Flow {
        match frame {
            Frame::Close => {
                debug!("peer sent close");
                Flow::Stop
            }
            Frame::Pong(_) => {
                self.deadline.as_mut().reset(Instant::now() + self.pong_wait);
                conn.mark_alive();
                Flow::Continue
            }
            Frame::Ping(payload) => {
                conn.queue_pong(payload);
                Flow::Continue
            }
            Frame::Text(text) => {
                handle_message(conn, hub, &text).await;
                Flow::Continue
            }
            Frame::Binary(bytes) => {
                match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_message(conn, hub, text).await,
                    Err(_) => reject(conn, ERR_BAD_JSON, "message is not valid UTF-8", 400),
                }
                Flow::Continue
            }
        }
    }
}

/// Decode and route one inbound data message.
async fn handle_message(conn: &Arc<WebConn>, hub: &Arc<Hub>, text: &str) {
    let limit = hub.settings().max_message_size;
    if text.len() > limit {
        debug!(size = text.len(), limit, "inbound message too large");
        reject(
            conn,
            ERR_TOO_LARGE,
            &format!("message of {} bytes exceeds the {limit} byte limit", text.len()),
            413,
        );
        return;
    }
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed client request");
            reject(conn, ERR_BAD_JSON, "malformed request", 400);
            return;
        }
    };
    let _ = hub.route(conn, request).await;
}

/// Reply to a message that never became a request. No seq is known.
fn reject(conn: &WebConn, id: &str, message: &str, status_code: u16) {
    let error = AppError::new("WebConn.read", id, message, status_code);
    let _ = conn.send_response(ClientResponse::error(0, error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use huddle_core::events::{Event, EventKind, PreparedEvent};
    use huddle_core::logging::capture_logs;
    use huddle_core::memory::InMemoryStore;
    use huddle_core::protocol::{ACTION_AUTHENTICATION_CHALLENGE, ACTION_PING};
    use huddle_core::session::Session;
    use serde_json::json;
    use tracing::Level;

    use crate::websocket::hub::Collaborators;
    use crate::websocket::transport::{MemoryPeer, memory_pair};

    fn far_future() -> i64 {
        huddle_core::now_millis() + 3_600_000
    }

    fn hub_with(store: &Arc<InMemoryStore>, ws: WebSocketSettings) -> Arc<Hub> {
        Arc::new(Hub::new(ws, "1.2.3", Collaborators::shared(store.clone()), false))
    }

    fn open(hub: &Arc<Hub>, session: Option<Session>, strategy: PumpStrategy) -> (Arc<WebConn>, MemoryPeer) {
        let (transport, peer) = memory_pair();
        let conn = hub.accept_with(transport, session, strategy);
        (conn, peer)
    }

    fn user(id: &str) -> Session {
        Session::new(id.into(), format!("tok-{id}"), far_future())
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(PumpStrategy::select(IoMode::Evented, true), PumpStrategy::Evented);
        assert_eq!(PumpStrategy::select(IoMode::Blocking, false), PumpStrategy::Blocking);
        assert_eq!(PumpStrategy::select(IoMode::Auto, true), PumpStrategy::Blocking);
        if cfg!(unix) {
            assert_eq!(PumpStrategy::select(IoMode::Auto, false), PumpStrategy::Evented);
        }
    }

    async fn hello_then_filtered_channel_event(strategy: PumpStrategy) {
        let store = Arc::new(InMemoryStore::new());
        store.set_memberships("u1".into(), ["c1".into()]);
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut peer) = open(&hub, Some(user("u1")), strategy);

        let hello = peer.next_json().await.unwrap();
        assert_eq!(hello["event"], "hello");
        assert_eq!(hello["seq"], 0);
        assert_eq!(hello["data"]["server_version"], "1.2.3");

        let report = hub.broadcast(Event::to_channel(EventKind::Posted, "c2".into())).await;
        assert_eq!(report.filtered, 1);
        let _ = hub.broadcast(Event::to_channel(EventKind::Posted, "c1".into()).with("n", 1)).await;

        let next = peer.next_json().await.unwrap();
        assert_eq!(next["broadcast"]["channel_id"], "c1");
        assert_eq!(next["seq"], 1);
    }

    #[tokio::test]
    async fn evented_hello_then_member_events_only() {
        hello_then_filtered_channel_event(PumpStrategy::Evented).await;
    }

    #[tokio::test]
    async fn blocking_hello_then_member_events_only() {
        hello_then_filtered_channel_event(PumpStrategy::Blocking).await;
    }

    #[tokio::test]
    async fn sequence_numbers_have_no_gaps() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);

        for n in 0..50 {
            let _ = hub.broadcast(Event::to_all(EventKind::Posted).with("n", n)).await;
        }
        // A reply in the middle does not consume a sequence number.
        peer.send_text(json!({"action": ACTION_PING, "seq": 9}).to_string());

        let mut seqs = Vec::new();
        let mut replies = 0;
        while seqs.len() < 51 || replies < 1 {
            let msg = peer.next_json().await.unwrap();
            if msg.get("event").is_some() {
                seqs.push(msg["seq"].as_u64().unwrap());
            } else {
                assert_eq!(msg["seq_reply"], 9);
                replies += 1;
            }
        }
        let expected: Vec<u64> = (0..51).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn ping_request_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Blocking);
        let _hello = peer.next_json().await.unwrap();

        peer.send_text(json!({"action": "ping", "seq": 1}).to_string());
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["status"], "OK");
        assert_eq!(reply["seq_reply"], 1);
        assert_eq!(reply["data"]["text"], "pong");
    }

    #[tokio::test]
    async fn malformed_and_oversized_messages_keep_connection_open() {
        let store = Arc::new(InMemoryStore::new());
        let ws = WebSocketSettings {
            max_message_size: 64,
            ..WebSocketSettings::default()
        };
        let hub = hub_with(&store, ws);
        let (conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);
        let _hello = peer.next_json().await.unwrap();

        peer.send_text("{not json");
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["error"]["id"], ERR_BAD_JSON);
        assert!(reply.get("seq_reply").is_none());

        peer.send_text("x".repeat(65));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["error"]["id"], ERR_TOO_LARGE);
        assert_eq!(reply["error"]["status_code"], 413);

        peer.send_text(json!({"action": "ping", "seq": 2}).to_string());
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["status"], "OK");
        assert!(!conn.is_closing());
    }

    #[tokio::test]
    async fn transport_ping_is_answered() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);
        let _hello = peer.next_json().await.unwrap();
        peer.send(Frame::Ping(Bytes::from_static(b"hi")));
        let frame = peer.next_frame().await.unwrap();
        assert_matches!(frame, Frame::Pong(p) if p == Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn authentication_over_the_socket() {
        let store = Arc::new(InMemoryStore::new());
        store.put_session(user("u1"));
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut peer) = open(&hub, None, PumpStrategy::Evented);

        peer.send_text(json!({"action": "ping", "seq": 1}).to_string());
        let denied = peer.next_json().await.unwrap();
        assert_eq!(denied["status"], "FAIL");

        peer.send_text(
            json!({"action": ACTION_AUTHENTICATION_CHALLENGE, "seq": 2, "data": {"token": "tok-u1"}})
                .to_string(),
        );
        let ok = peer.next_json().await.unwrap();
        assert_eq!(ok["seq_reply"], 2);
        assert_eq!(ok["status"], "OK");
        let hello = peer.next_json().await.unwrap();
        assert_eq!(hello["event"], "hello");
        assert_eq!(hub.connections_for_user(&"u1".into()).len(), 1);
    }

    async fn bad_token_closes_after_reply(strategy: PumpStrategy) {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, mut peer) = open(&hub, None, strategy);

        peer.send_text(
            json!({"action": ACTION_AUTHENTICATION_CHALLENGE, "seq": 1, "data": {"token": "nope"}})
                .to_string(),
        );
        let denied = peer.next_json().await.unwrap();
        assert_eq!(denied["seq_reply"], 1);
        assert_eq!(denied["status"], "FAIL");
        assert_eq!(denied["error"]["id"], huddle_core::protocol::ERR_BAD_TOKEN);
        assert_matches!(peer.next_frame().await, Some(Frame::Close));
        conn.closed().await;
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn bad_token_closes_after_reply_evented() {
        bad_token_closes_after_reply(PumpStrategy::Evented).await;
    }

    #[tokio::test]
    async fn bad_token_closes_after_reply_blocking() {
        bad_token_closes_after_reply(PumpStrategy::Blocking).await;
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_connection_closed_after_grace() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, mut peer) = open(&hub, None, PumpStrategy::Blocking);
        conn.closed().await;
        assert_eq!(hub.connection_count(), 0);
        assert_matches!(peer.next_frame().await, Some(Frame::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);
        let _hello = peer.next_json().await.unwrap();

        // One keep-alive ping at 60% of the read deadline, then the deadline.
        assert_matches!(peer.next_frame().await, Some(Frame::Ping(_)));
        conn.closed().await;
        assert!(conn.connected_for() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_extend_the_read_deadline() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, mut peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);
        let _hello = peer.next_json().await.unwrap();
        for _ in 0..3 {
            assert_matches!(peer.next_frame().await, Some(Frame::Ping(_)));
            peer.send(Frame::Pong(Bytes::new()));
        }
        assert!(!conn.is_closing());
        assert!(conn.connected_for() >= Duration::from_secs(180));
    }

    #[tokio::test]
    async fn double_close_tears_down_once() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        for strategy in [PumpStrategy::Evented, PumpStrategy::Blocking] {
            let (conn, peer) = open(&hub, Some(user("u1")), strategy);
            let (a, b) = (conn.clone(), conn.clone());
            let ((), ()) = tokio::join!(a.close(), b.close());
            peer.hang_up();
            conn.close().await;
            assert_eq!(conn.teardown_count(), 1);
            assert!(!hub.unregister(&conn));
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn peer_hang_up_unregisters() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, peer) = open(&hub, Some(user("u1")), PumpStrategy::Blocking);
        peer.hang_up();
        conn.closed().await;
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connections_for_user(&"u1".into()).is_empty());
    }

    #[tokio::test]
    async fn dropped_peer_tears_down() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, peer) = open(&hub, Some(user("u1")), PumpStrategy::Evented);
        drop(peer);
        let _ = hub.broadcast(Event::to_all(EventKind::Posted)).await;
        conn.closed().await;
        assert_eq!(conn.teardown_count(), 1);
        assert_eq!(hub.connection_count(), 0);
    }

    /// Fill a pump-less connection's queue, then start its pump.
    fn prefilled(
        hub: &Arc<Hub>,
        events: impl IntoIterator<Item = EventKind>,
    ) -> (Arc<WebConn>, MemoryPeer) {
        let (conn, channels) = WebConn::new(Some(user("u1")), hub.settings());
        hub.register(&conn);
        for kind in events {
            let prepared = PreparedEvent::new(Event::to_all(kind)).unwrap();
            let _ = conn.queue().try_push(Outbound::Event(prepared));
        }
        let (transport, peer) = memory_pair();
        let _ = spawn(PumpStrategy::Evented, conn.clone(), hub.clone(), transport, channels);
        (conn, peer)
    }

    #[tokio::test]
    async fn droppable_events_discarded_when_behind() {
        let store = Arc::new(InMemoryStore::new());
        let ws = WebSocketSettings {
            send_queue_size: 8,
            ..WebSocketSettings::default()
        };
        let hub = hub_with(&store, ws);
        // hello + 7 more: typing events sit past the 50% mark when dequeued.
        let kinds = [
            EventKind::Typing,
            EventKind::Posted,
            EventKind::Typing,
            EventKind::Posted,
            EventKind::Posted,
            EventKind::Posted,
            EventKind::Posted,
        ];
        let (conn, mut peer) = prefilled(&hub, kinds);

        let mut received = Vec::new();
        while received.len() < 6 {
            let msg = peer.next_json().await.unwrap();
            received.push(msg["event"].as_str().unwrap().to_owned());
        }
        assert_eq!(received, ["hello", "posted", "posted", "posted", "posted", "posted"]);
        assert_eq!(conn.dropped_events(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn nearly_full_queue_is_logged() {
        let (logs, _guard) = capture_logs();
        let store = Arc::new(InMemoryStore::new());
        let ws = WebSocketSettings {
            send_queue_size: 20,
            ..WebSocketSettings::default()
        };
        let hub = hub_with(&store, ws);
        let (conn, channels) = WebConn::new(Some(user("u1")), hub.settings());
        for _ in 0..20 {
            let event = Event::to_channel(EventKind::Posted, "c1".into());
            let _ = conn.queue().try_push(Outbound::Event(PreparedEvent::new(event).unwrap()));
        }
        let (transport, mut peer) = memory_pair();
        let _ = spawn(PumpStrategy::Evented, conn.clone(), hub.clone(), transport, channels);

        let Some(Frame::Text(first)) = peer.next_frame().await else {
            panic!("expected a text frame");
        };

        let event = logs
            .events()
            .into_iter()
            .find(|e| e.message.contains("outbound queue nearly full"))
            .unwrap();
        assert_eq!(event.level, Level::WARN);
        assert_eq!(event.field("user_id"), Some("u1"));
        assert_eq!(event.field("event_type"), Some("posted"));
        assert_eq!(event.field("channel_id"), Some("c1"));
        assert_eq!(event.field("queue_len"), Some("19"));
        let size = first.len().to_string();
        assert_eq!(event.field("size"), Some(size.as_str()));
        assert_eq!(event.field("capacity"), Some("20"));
    }
}
