//! Per-connection authentication snapshot and channel membership cache.
//!
//! Both caches are read on every broadcast and replaced whole: readers
//! clone an `Arc` out of the lock and never hold it across an await, so an
//! external invalidation can race the pump's own reads safely.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, error};

use huddle_core::session::Session;
use huddle_core::store::{ChannelStore, SessionStore};
use huddle_core::{ChannelId, StoreError, UserId};

/// Immutable view of a connection's authentication.
#[derive(Clone, Debug, Default)]
pub struct SessionSnapshot {
    /// Bearer token; empty when the connection never authenticated.
    pub token: String,
    /// Resolved session; `None` until resolved or after invalidation.
    pub session: Option<Arc<Session>>,
    /// Session expiry in Unix milliseconds; `0` means unknown, so the
    /// session is re-resolved on every check.
    pub expires_at: i64,
}

impl SessionSnapshot {
    /// Snapshot for a freshly resolved session.
    pub fn resolved(session: Session) -> Self {
        Self {
            token: session.token.clone(),
            expires_at: session.expires_at,
            session: Some(Arc::new(session)),
        }
    }

    /// Whether the session must be re-resolved before use at `now_millis`.
    pub fn is_stale_at(&self, now_millis: i64) -> bool {
        self.session.is_none() || self.expires_at <= now_millis
    }
}

struct MembershipCache {
    channels: Arc<HashSet<ChannelId>>,
    fetched_at: Instant,
}

/// Session and membership state of one connection.
pub struct SessionState {
    snapshot: RwLock<Arc<SessionSnapshot>>,
    members: RwLock<Option<MembershipCache>>,
    member_ttl: Duration,
}

impl SessionState {
    /// State for a connection that starts with `session` (or anonymous).
    pub fn new(session: Option<Session>, member_ttl: Duration) -> Self {
        let snapshot = session.map(SessionSnapshot::resolved).unwrap_or_default();
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            members: RwLock::new(None),
            member_ttl,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.read().clone()
    }

    /// Current token.
    pub fn token(&self) -> String {
        self.snapshot.read().token.clone()
    }

    /// User of the cached session, if any.
    pub fn user_id(&self) -> Option<UserId> {
        self.snapshot
            .read()
            .session
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    /// Whether a session is cached, without refreshing it.
    pub fn has_session(&self) -> bool {
        self.snapshot.read().session.is_some()
    }

    /// Install a freshly resolved session.
    pub fn install(&self, session: Session) {
        *self.snapshot.write() = Arc::new(SessionSnapshot::resolved(session));
    }

    /// Forget token, session, and expiry.
    pub fn clear(&self) {
        *self.snapshot.write() = Arc::new(SessionSnapshot::default());
    }

    /// Drop the cached session (keeping the token) and the membership cache.
    ///
    /// The next authentication check re-resolves from the store.
    pub fn invalidate(&self) {
        let token = self.token();
        *self.snapshot.write() = Arc::new(SessionSnapshot {
            token,
            session: None,
            expires_at: 0,
        });
        *self.members.write() = None;
    }

    /// Whether the connection holds a valid session, re-resolving it when stale.
    ///
    /// A failed re-resolve clears token, session, and expiry.
    pub async fn is_authenticated(&self, sessions: &dyn SessionStore) -> bool {
        let snapshot = self.snapshot();
        if snapshot.token.is_empty() {
            return false;
        }
        if !snapshot.is_stale_at(huddle_core::now_millis()) {
            return true;
        }

        match sessions.resolve_session(&snapshot.token).await {
            Ok(session) => {
                self.install(session);
                true
            }
            Err(e) => {
                debug!(error = %e, "session no longer valid, clearing connection auth");
                self.clear();
                false
            }
        }
    }

    /// Channels the user belongs to, from cache when younger than the TTL.
    pub async fn channel_memberships(
        &self,
        user_id: &UserId,
        channels: &dyn ChannelStore,
    ) -> Result<Arc<HashSet<ChannelId>>, StoreError> {
        let cached = self
            .members
            .read()
            .as_ref()
            .filter(|cache| cache.fetched_at.elapsed() < self.member_ttl)
            .map(|cache| cache.channels.clone());
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let fetched = channels
            .all_channel_memberships(user_id)
            .await
            .inspect_err(|e| {
                error!(user_id = %user_id, error = %e, "failed to load channel memberships");
            })?;
        let fetched = Arc::new(fetched);
        *self.members.write() = Some(MembershipCache {
            channels: fetched.clone(),
            fetched_at: Instant::now(),
        });
        Ok(fetched)
    }

    /// Drop the membership cache only.
    pub fn invalidate_memberships(&self) {
        *self.members.write() = None;
    }
}
