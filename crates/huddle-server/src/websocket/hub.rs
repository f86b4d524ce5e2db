//! Connection registry and broadcast fan-out.
//!
//! The hub is an explicitly constructed value shared as `Arc<Hub>` by the
//! HTTP layer and every event producer. Its tables are only locked for
//! insertion and removal; broadcasts snapshot the candidate connections
//! first and enqueue without holding any table lock.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use huddle_core::events::{Event, EventKind, PreparedEvent};
use huddle_core::protocol::{ClientRequest, ClientResponse};
use huddle_core::session::Session;
use huddle_core::store::{Authorizer, ChannelStore, SessionStore};
use huddle_core::{ConnectionId, UserId};
use huddle_settings::WebSocketSettings;

use super::connection::WebConn;
use super::filter::VisibilityFilter;
use super::outbound::EnqueueOutcome;
use super::pump::{self, PumpStrategy};
use super::router::{ActionContext, ActionRouter};
use super::transport::Transport;

/// External collaborators the hub consults.
#[derive(Clone)]
pub struct Collaborators {
    /// Session lookups.
    pub sessions: Arc<dyn SessionStore>,
    /// Channel membership lookups.
    pub channels: Arc<dyn ChannelStore>,
    /// Authorization decisions.
    pub authorizer: Arc<dyn Authorizer>,
}

impl Collaborators {
    /// Use one store for every collaborator.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SessionStore + ChannelStore + Authorizer + 'static,
    {
        Self {
            sessions: store.clone(),
            channels: store.clone(),
            authorizer: store,
        }
    }
}

/// Per-broadcast delivery counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Enqueued onto a connection.
    pub delivered: usize,
    /// Rejected by the visibility filter.
    pub filtered: usize,
    /// Discarded by a slow connection's drop policy.
    pub dropped: usize,
    /// Connections closed because their queue was full.
    pub closed: usize,
}

/// The connection registry.
pub struct Hub {
    connections: DashMap<ConnectionId, Arc<WebConn>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    settings: WebSocketSettings,
    server_version: String,
    strategy: PumpStrategy,
    sessions: Arc<dyn SessionStore>,
    filter: VisibilityFilter,
    router: ActionRouter,
    read_permits: Semaphore,
}

impl Hub {
    /// Create a hub with the built-in actions.
    ///
    /// `tls` rules out the evented pump when the I/O mode is `auto`.
    pub fn new(
        settings: WebSocketSettings,
        server_version: impl Into<String>,
        collaborators: Collaborators,
        tls: bool,
    ) -> Self {
        let strategy = PumpStrategy::select(settings.io_mode, tls);
        let read_permits = Semaphore::new(settings.max_concurrent_reads.max(1));
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            server_version: server_version.into(),
            strategy,
            filter: VisibilityFilter::new(
                collaborators.sessions.clone(),
                collaborators.channels,
                collaborators.authorizer,
            ),
            sessions: collaborators.sessions,
            router: ActionRouter::with_builtins(),
            read_permits,
            settings,
        }
    }

    /// Replace the action router.
    #[must_use]
    pub fn with_router(mut self, router: ActionRouter) -> Self {
        self.router = router;
        self
    }

    /// Socket settings.
    pub fn settings(&self) -> &WebSocketSettings {
        &self.settings
    }

    /// Version string announced in `hello`.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Pump strategy used by [`accept`](Self::accept).
    pub fn strategy(&self) -> PumpStrategy {
        self.strategy
    }

    /// Session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// The visibility filter.
    pub fn filter(&self) -> &VisibilityFilter {
        &self.filter
    }

    pub(crate) fn read_permits(&self) -> &Semaphore {
        &self.read_permits
    }

    /// Register a new connection over `transport` and start its pump.
    pub fn accept(self: &Arc<Self>, transport: Transport, session: Option<Session>) -> Arc<WebConn> {
        self.accept_with(transport, session, self.strategy)
    }

    /// [`accept`](Self::accept) with an explicit pump strategy.
    pub fn accept_with(
        self: &Arc<Self>,
        transport: Transport,
        session: Option<Session>,
        strategy: PumpStrategy,
    ) -> Arc<WebConn> {
        let (conn, channels) = WebConn::new(session, &self.settings);
        self.register(&conn);
        let _ = pump::spawn(strategy, conn.clone(), self.clone(), transport, channels);
        conn
    }

    /// Add a connection to the table. Authenticated connections get `hello`.
    pub fn register(&self, conn: &Arc<WebConn>) {
        let _ = self.connections.insert(conn.id().clone(), conn.clone());
        self.index_user(conn);
        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        info!(
            conn_id = %conn.id(),
            user_id = conn.user_id().as_ref().map_or("", UserId::as_str),
            "websocket connection registered"
        );
        if conn.state().has_session() {
            let _ = self.send_hello(conn);
        }
    }

    /// Remove a connection. Returns `false` when it was not registered.
    pub fn unregister(&self, conn: &WebConn) -> bool {
        let removed = self.connections.remove(conn.id()).is_some();
        if let Some(user_id) = conn.set_indexed_user(None) {
            self.unindex(&user_id, conn.id());
        }
        if removed {
            counter!("ws_disconnections_total").increment(1);
            gauge!("ws_connections_active").decrement(1.0);
            histogram!("ws_connection_duration_seconds")
                .record(conn.connected_for().as_secs_f64());
            info!(conn_id = %conn.id(), "websocket connection unregistered");
        }
        removed
    }

    /// Called once a connection completes an authentication challenge.
    pub(crate) fn on_authenticated(&self, conn: &Arc<WebConn>) {
        self.index_user(conn);
        let _ = self.send_hello(conn);
    }

    /// Enqueue the `hello` event for `conn`.
    pub fn send_hello(&self, conn: &WebConn) -> EnqueueOutcome {
        let Some(user_id) = conn.user_id() else {
            return EnqueueOutcome::Closed;
        };
        let hello = Event::to_user(EventKind::Hello, user_id)
            .with("server_version", self.server_version.as_str())
            .with("connection_id", conn.id().as_str());
        match PreparedEvent::new(hello) {
            Ok(prepared) => {
                let outcome = conn.send_event(prepared);
                if outcome == EnqueueOutcome::Full {
                    conn.close_on_full(EventKind::Hello.as_str());
                }
                outcome
            }
            Err(e) => {
                error!(error = %e, "failed to encode hello event");
                EnqueueOutcome::Closed
            }
        }
    }

    fn index_user(&self, conn: &WebConn) {
        let Some(user_id) = conn.user_id() else {
            return;
        };
        if let Some(previous) = conn.set_indexed_user(Some(user_id.clone())) {
            if previous == user_id {
                return;
            }
            self.unindex(&previous, conn.id());
        }
        let _ = self
            .by_user
            .entry(user_id)
            .or_default()
            .insert(conn.id().clone());
    }

    fn unindex(&self, user_id: &UserId, conn_id: &ConnectionId) {
        if let Some(mut ids) = self.by_user.get_mut(user_id) {
            let _ = ids.remove(conn_id);
        }
        let _ = self.by_user.remove_if(user_id, |_, ids| ids.is_empty());
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Look up a connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<WebConn>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Every connection of `user_id`.
    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<Arc<WebConn>> {
        let ids: Vec<ConnectionId> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.connection(id)).collect()
    }

    fn candidates(&self, event: &Event) -> Vec<Arc<WebConn>> {
        let conns = match &event.broadcast().user_id {
            Some(user_id) => self.connections_for_user(user_id),
            None => self
                .connections
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };
        conns.into_iter().filter(|c| !c.is_closing()).collect()
    }

    /// Deliver `event` to every connection that passes the visibility filter.
    ///
    /// Never waits on a connection's queue: droppable events are discarded
    /// for slow connections and a full queue closes its connection.
    pub async fn broadcast(&self, event: Event) -> BroadcastReport {
        let prepared = match PreparedEvent::new(event) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "failed to encode broadcast event");
                return BroadcastReport::default();
            }
        };
        let targets = self.candidates(prepared.event());
        let decisions = join_all(
            targets
                .iter()
                .map(|conn| self.filter.should_deliver(conn.state(), prepared.event())),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (conn, deliver) in targets.iter().zip(decisions) {
            if !deliver {
                report.filtered += 1;
                continue;
            }
            match conn.send_event(prepared.clone()) {
                EnqueueOutcome::Queued => report.delivered += 1,
                EnqueueOutcome::Dropped => report.dropped += 1,
                EnqueueOutcome::Full => {
                    report.closed += 1;
                    conn.close_on_full(prepared.kind().as_str());
                }
                EnqueueOutcome::Closed => {}
            }
        }
        debug!(
            event_type = %prepared.kind(),
            delivered = report.delivered,
            filtered = report.filtered,
            dropped = report.dropped,
            closed = report.closed,
            "broadcast complete"
        );
        report
    }

    /// Broadcast in the background.
    pub fn publish(self: &Arc<Self>, event: Event) {
        let hub = self.clone();
        let _ = tokio::spawn(async move {
            let _ = hub.broadcast(event).await;
        });
    }

    /// Route a decoded client request from `conn` and enqueue the reply.
    pub async fn route(self: &Arc<Self>, conn: &Arc<WebConn>, request: ClientRequest) -> ClientResponse {
        let ctx = ActionContext { hub: self, conn };
        self.router.dispatch(request, &ctx).await
    }

    /// Drop cached session and memberships on all of `user_id`'s connections.
    pub fn invalidate_cache_for_user(&self, user_id: &UserId) {
        let conns = self.connections_for_user(user_id);
        for conn in &conns {
            conn.state().invalidate();
        }
        debug!(user_id = %user_id, connections = conns.len(), "invalidated connection caches");
    }

    /// Close every connection and wait for their teardown.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<WebConn>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if conns.is_empty() {
            return;
        }
        info!(count = conns.len(), "closing all websocket connections");
        let _ = join_all(conns.iter().map(|conn| conn.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::memory::InMemoryStore;
    use huddle_core::session::ROLE_SYSTEM_ADMIN;
    use tokio::sync::mpsc;

    use crate::websocket::connection::ConnectionChannels;
    use crate::websocket::outbound::Outbound;

    fn far_future() -> i64 {
        huddle_core::now_millis() + 3_600_000
    }

    fn hub_with(store: &Arc<InMemoryStore>, ws: WebSocketSettings) -> Arc<Hub> {
        Arc::new(Hub::new(ws, "1.0.0", Collaborators::shared(store.clone()), false))
    }

    fn session(user: &str) -> Session {
        Session::new(user.into(), format!("tok-{user}"), far_future())
    }

    /// Register a pump-less connection so tests can inspect its queue.
    fn attach(hub: &Hub, session: Option<Session>) -> (Arc<WebConn>, ConnectionChannels) {
        let (conn, channels) = WebConn::new(session, hub.settings());
        hub.register(&conn);
        (conn, channels)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Some(kind) = item.kind() {
                kinds.push(kind.as_str().to_owned());
            }
        }
        kinds
    }

    #[test]
    fn register_sends_hello_first() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, mut ch) = attach(&hub, Some(session("u1")));
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.connections_for_user(&"u1".into()).len(), 1);
        let Ok(Outbound::Event(hello)) = ch.outbound.try_recv() else {
            panic!("expected hello");
        };
        assert_eq!(hello.kind(), &EventKind::Hello);
        assert_eq!(hello.event().data().get_str("server_version"), Some("1.0.0"));
        assert_eq!(
            hello.event().data().get_str("connection_id"),
            Some(conn.id().as_str())
        );
    }

    #[test]
    fn anonymous_connection_gets_no_hello() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut ch) = attach(&hub, None);
        assert!(ch.outbound.try_recv().is_err());
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn hello_on_full_queue_closes() {
        let store = Arc::new(InMemoryStore::new());
        let ws = WebSocketSettings {
            send_queue_size: 1,
            ..WebSocketSettings::default()
        };
        let hub = hub_with(&store, ws);
        let (conn, _ch) = WebConn::new(Some(session("u1")), hub.settings());
        let _ = conn.send_response(ClientResponse::ok(1, None));
        hub.register(&conn);
        assert!(conn.is_closing());
    }

    #[test]
    fn unregister_is_reported_once() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, _ch) = attach(&hub, Some(session("u1")));
        assert!(hub.unregister(&conn));
        assert!(!hub.unregister(&conn));
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connections_for_user(&"u1".into()).is_empty());
    }

    #[tokio::test]
    async fn channel_broadcast_skips_non_members() {
        let store = Arc::new(InMemoryStore::new());
        store.set_memberships("member".into(), ["c1".into()]);
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_a, mut member) = attach(&hub, Some(session("member")));
        let (_b, mut outsider) = attach(&hub, Some(session("outsider")));

        let report = hub
            .broadcast(Event::to_channel(EventKind::Posted, "c1".into()))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(drain(&mut member.outbound), vec!["hello", "posted"]);
        assert_eq!(drain(&mut outsider.outbound), vec!["hello"]);
    }

    #[tokio::test]
    async fn sensitive_broadcast_reaches_admins_only() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_a, mut admin) = attach(&hub, Some(session("a").with_roles(ROLE_SYSTEM_ADMIN)));
        let (_b, mut plain) = attach(&hub, Some(session("b")));
        let report = hub
            .broadcast(Event::to_all(EventKind::ConfigChanged).sensitive())
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(drain(&mut admin.outbound), vec!["hello", "config_changed"]);
        assert_eq!(drain(&mut plain.outbound), vec!["hello"]);
    }

    #[tokio::test]
    async fn user_target_uses_index() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_a, mut one) = attach(&hub, Some(session("u1")));
        let (_b, mut two) = attach(&hub, Some(session("u1")));
        let (_c, mut other) = attach(&hub, Some(session("u2")));
        let report = hub
            .broadcast(Event::to_user(EventKind::PreferencesChanged, "u1".into()))
            .await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.filtered, 0);
        assert_eq!(drain(&mut one.outbound).len(), 2);
        assert_eq!(drain(&mut two.outbound).len(), 2);
        assert_eq!(drain(&mut other.outbound), vec!["hello"]);
    }

    #[tokio::test]
    async fn concurrent_broadcasts_enqueue_each_pair_once() {
        const CONNS: usize = 8;
        const EVENTS: usize = 20;
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let mut channels = Vec::new();
        for i in 0..CONNS {
            let (_conn, ch) = attach(&hub, Some(session(&format!("u{i}"))));
            channels.push(ch);
        }

        let tasks: Vec<_> = (0..EVENTS)
            .map(|n| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    hub.broadcast(Event::to_all(EventKind::Posted).with("n", n)).await
                })
            })
            .collect();
        let mut delivered = 0;
        for task in tasks {
            delivered += task.await.unwrap().delivered;
        }
        assert_eq!(delivered, CONNS * EVENTS);

        for ch in &mut channels {
            let mut seen = Vec::new();
            while let Ok(Outbound::Event(ev)) = ch.outbound.try_recv() {
                if ev.kind() == &EventKind::Posted {
                    seen.push(ev.event().data().get("n").unwrap().as_u64().unwrap());
                }
            }
            seen.sort_unstable();
            let expected: Vec<u64> = (0..EVENTS as u64).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_droppable_and_closes_on_valuable() {
        let store = Arc::new(InMemoryStore::new());
        let ws = WebSocketSettings {
            send_queue_size: 4,
            ..WebSocketSettings::default()
        };
        let hub = hub_with(&store, ws);
        let (conn, _ch) = attach(&hub, Some(session("u1")));
        for _ in 0..3 {
            let _ = hub.broadcast(Event::to_all(EventKind::Posted)).await;
        }
        assert_eq!(conn.queue().len(), 4);

        let report = hub.broadcast(Event::to_all(EventKind::Typing)).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(conn.queue().len(), 4);
        assert!(!conn.is_closing());

        let report = hub.broadcast(Event::to_all(EventKind::Posted)).await;
        assert_eq!(report.closed, 1);
        assert!(conn.is_closing());

        // Closing connections are no longer candidates.
        let report = hub.broadcast(Event::to_all(EventKind::Posted)).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn invalidate_forces_session_refresh() {
        let store = Arc::new(InMemoryStore::new());
        store.put_session(session("u1"));
        let hub = hub_with(&store, WebSocketSettings::default());
        let (conn, _ch) = attach(&hub, Some(session("u1")));
        hub.invalidate_cache_for_user(&"u1".into());
        assert!(!conn.state().has_session());

        let _ = hub.broadcast(Event::to_all(EventKind::EmojiAdded)).await;
        assert_eq!(store.resolve_calls(), 1);
        assert!(conn.state().has_session());
    }

    #[tokio::test]
    async fn invalidate_with_revoked_session_stops_delivery() {
        let store = Arc::new(InMemoryStore::new());
        let hub = hub_with(&store, WebSocketSettings::default());
        let (_conn, mut ch) = attach(&hub, Some(session("u1")));
        hub.invalidate_cache_for_user(&"u1".into());
        let report = hub.broadcast(Event::to_all(EventKind::EmojiAdded)).await;
        assert_eq!(report.filtered, 1);
        assert_eq!(drain(&mut ch.outbound), vec!["hello"]);
    }
}
