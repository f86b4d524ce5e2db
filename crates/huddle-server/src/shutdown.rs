//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use huddle_push::PushHub;

use crate::websocket::Hub;

/// Default timeout for graceful shutdown before giving up on stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown of the listener, connections, and push workers.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown. The listener stops accepting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut everything down within `timeout`.
    ///
    /// 1. Cancel the token (listener stops accepting)
    /// 2. Close every connection and wait for their teardown
    /// 3. Stop the push hub and let workers drain with the remaining time
    ///
    /// Returns `false` if anything was still running when time ran out.
    pub async fn graceful_shutdown(
        &self,
        hub: &Hub,
        push: Option<&PushHub>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;

        self.shutdown();
        info!(
            connections = hub.connection_count(),
            push_enabled = push.is_some(),
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );

        let mut clean = true;
        if tokio::time::timeout_at(deadline, hub.close_all()).await.is_err() {
            warn!(
                remaining = hub.connection_count(),
                "connections did not close before the shutdown timeout"
            );
            clean = false;
        }

        if let Some(push) = push {
            let remaining = deadline.saturating_duration_since(Instant::now());
            clean &= push.shutdown(remaining).await;
        }
        clean
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use huddle_core::memory::InMemoryStore;
    use huddle_core::session::Session;
    use huddle_settings::WebSocketSettings;

    use crate::websocket::{Collaborators, memory_pair};

    fn hub() -> Arc<Hub> {
        let store = Arc::new(InMemoryStore::new());
        Arc::new(Hub::new(
            WebSocketSettings::default(),
            "test",
            Collaborators::shared(store),
            false,
        ))
    }

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
    }

    #[test]
    fn token_propagation() {
        let coord = ShutdownCoordinator::default();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_closes_connections() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        let mut peers = Vec::new();
        for i in 0..3 {
            let (transport, peer) = memory_pair();
            let session = Session::new(format!("u{i}").into(), "t", 0);
            let _ = hub.accept(transport, Some(session));
            peers.push(peer);
        }
        assert_eq!(hub.connection_count(), 3);

        assert!(coord.graceful_shutdown(&hub, None, None).await);
        assert!(coord.is_shutting_down());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn empty_hub_shuts_down_immediately() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        assert!(
            coord
                .graceful_shutdown(&hub, None, Some(Duration::from_millis(10)))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connection_times_out() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        // Registered without a pump, so nothing ever tears it down.
        let (conn, _channels) = crate::websocket::WebConn::new(None, hub.settings());
        hub.register(&conn);

        let clean = coord
            .graceful_shutdown(&hub, None, Some(Duration::from_secs(1)))
            .await;
        assert!(!clean);
        assert!(conn.is_closing());
    }
}
