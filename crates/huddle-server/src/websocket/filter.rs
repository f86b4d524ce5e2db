//! Visibility filter: whether one connection should receive one event.
//!
//! Rules run in a fixed order and the first decisive rule wins:
//!
//! 1. unauthenticated connections receive nothing
//! 2. sanitized payloads skip sessions that can see private data
//! 3. sensitive payloads reach only sessions that can see private data
//! 4. user-targeted events reach only that user
//! 5. users in the omit set are skipped
//! 6. channel-targeted events need channel membership
//! 7. team-targeted events need team membership
//! 8. guests only hear about users they are allowed to see
//! 9. everything else is delivered
//!
//! Store failures deny delivery for the affected pair only.

use std::sync::Arc;

use tracing::{debug, error};

use huddle_core::UserId;
use huddle_core::events::{Event, EventKind};
use huddle_core::store::{Authorizer, ChannelStore, SessionStore};

use super::session_state::SessionState;

/// Stateless rule engine; per-connection state lives in [`SessionState`].
#[derive(Clone)]
pub struct VisibilityFilter {
    sessions: Arc<dyn SessionStore>,
    channels: Arc<dyn ChannelStore>,
    authorizer: Arc<dyn Authorizer>,
}

impl VisibilityFilter {
    /// Create a filter over the given collaborators.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        channels: Arc<dyn ChannelStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            sessions,
            channels,
            authorizer,
        }
    }

    /// Decide delivery of `event` to the connection owning `state`.
    pub async fn should_deliver(&self, state: &SessionState, event: &Event) -> bool {
        if !state.is_authenticated(self.sessions.as_ref()).await {
            return false;
        }
        let snapshot = state.snapshot();
        let Some(session) = snapshot.session.as_ref() else {
            return false;
        };
        let broadcast = event.broadcast();

        if broadcast.contains_sanitized_data && self.authorizer.can_see_private_data(session) {
            return false;
        }
        if broadcast.contains_sensitive_data && !self.authorizer.can_see_private_data(session) {
            return false;
        }

        if let Some(target) = &broadcast.user_id {
            return target == &session.user_id;
        }

        if broadcast.omit_users.contains(&session.user_id) {
            return false;
        }

        if let Some(channel_id) = &broadcast.channel_id {
            return match state
                .channel_memberships(&session.user_id, self.channels.as_ref())
                .await
            {
                Ok(channels) => channels.contains(channel_id),
                Err(_) => false,
            };
        }

        if let Some(team_id) = &broadcast.team_id {
            return session.team(team_id).is_some();
        }

        if session.is_guest() {
            return self.guest_may_see(&session.user_id, event).await;
        }

        true
    }

    /// Guests only learn about users they may see.
    async fn guest_may_see(&self, viewer: &UserId, event: &Event) -> bool {
        let subject = match event.kind() {
            EventKind::UserUpdated => event.data().get_path_str(&["user", "id"]),
            EventKind::NewUser => event.data().get_str("user_id"),
            _ => return true,
        };
        let Some(subject) = subject else {
            debug!(event_type = %event.kind(), "guest filter: event names no user");
            return false;
        };

        match self
            .authorizer
            .can_user_see_user(viewer, &UserId::from(subject))
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                error!(user_id = %viewer, error = %e, "guest visibility check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use huddle_core::memory::InMemoryStore;
    use huddle_core::session::{ROLE_SYSTEM_ADMIN, Session};
    use proptest::prelude::*;
    use serde_json::json;

    fn far_future() -> i64 {
        huddle_core::now_millis() + 3_600_000
    }

    fn filter(store: &Arc<InMemoryStore>) -> VisibilityFilter {
        VisibilityFilter::new(store.clone(), store.clone(), store.clone())
    }

    fn state_for(session: Session) -> SessionState {
        SessionState::new(Some(session), Duration::from_secs(1800))
    }

    fn user(id: &str) -> Session {
        Session::new(id.into(), format!("tok-{id}"), far_future())
    }

    #[tokio::test]
    async fn unauthenticated_receives_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let anon = SessionState::new(None, Duration::from_secs(60));
        let ev = Event::to_all(EventKind::ConfigChanged);
        assert!(!filter(&store).should_deliver(&anon, &ev).await);
    }

    #[tokio::test]
    async fn sanitized_skips_privileged_sessions() {
        let store = Arc::new(InMemoryStore::new());
        let f = filter(&store);
        let ev = Event::to_all(EventKind::ConfigChanged).sanitized();
        let admin = state_for(user("a").with_roles(ROLE_SYSTEM_ADMIN));
        let plain = state_for(user("b"));
        assert!(!f.should_deliver(&admin, &ev).await);
        assert!(f.should_deliver(&plain, &ev).await);
    }

    #[tokio::test]
    async fn sensitive_reaches_privileged_sessions_only() {
        let store = Arc::new(InMemoryStore::new());
        let f = filter(&store);
        let ev = Event::to_all(EventKind::ConfigChanged).sensitive();
        let admin = state_for(user("a").with_roles(ROLE_SYSTEM_ADMIN));
        let plain = state_for(user("b"));
        assert!(f.should_deliver(&admin, &ev).await);
        assert!(!f.should_deliver(&plain, &ev).await);
    }

    #[tokio::test]
    async fn user_target_wins_over_omit_set() {
        let store = Arc::new(InMemoryStore::new());
        let f = filter(&store);
        let ev = Event::to_user(EventKind::PreferencesChanged, "u1".into()).omit_users(["u1".into()]);
        assert!(f.should_deliver(&state_for(user("u1")), &ev).await);
        assert!(!f.should_deliver(&state_for(user("u2")), &ev).await);
    }

    #[tokio::test]
    async fn omitted_user_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        store.set_memberships("u1".into(), ["c1".into()]);
        let f = filter(&store);
        let ev = Event::to_channel(EventKind::Typing, "c1".into()).omit_users(["u1".into()]);
        assert!(!f.should_deliver(&state_for(user("u1")), &ev).await);
        // Short-circuits before the membership lookup.
        assert_eq!(store.membership_calls(), 0);
    }

    #[tokio::test]
    async fn channel_events_need_membership() {
        let store = Arc::new(InMemoryStore::new());
        store.set_memberships("u1".into(), ["c1".into()]);
        let f = filter(&store);
        let member = state_for(user("u1"));
        assert!(f.should_deliver(&member, &Event::to_channel(EventKind::Posted, "c1".into())).await);
        assert!(!f.should_deliver(&member, &Event::to_channel(EventKind::Posted, "c2".into())).await);
        assert_eq!(store.membership_calls(), 1);
    }

    #[tokio::test]
    async fn membership_store_failure_denies() {
        let store = Arc::new(InMemoryStore::new());
        store.set_memberships("u1".into(), ["c1".into()]);
        store.fail_memberships(true);
        let f = filter(&store);
        let ev = Event::to_channel(EventKind::Posted, "c1".into());
        assert!(!f.should_deliver(&state_for(user("u1")), &ev).await);
    }

    #[tokio::test]
    async fn team_events_need_team_membership() {
        let store = Arc::new(InMemoryStore::new());
        let f = filter(&store);
        let ev = Event::to_team(EventKind::UpdateTeam, "t1".into());
        assert!(f.should_deliver(&state_for(user("u1").with_team("t1".into())), &ev).await);
        assert!(!f.should_deliver(&state_for(user("u2").with_team("t2".into())), &ev).await);
    }

    #[tokio::test]
    async fn team_check_refreshes_stale_session() {
        let store = Arc::new(InMemoryStore::new());
        let fresh = Session::new("u1".into(), "tok", far_future()).with_team("t1".into());
        store.put_session(fresh);
        let stale = SessionState::new(
            Some(Session::new("u1".into(), "tok", 1)),
            Duration::from_secs(60),
        );
        let ev = Event::to_team(EventKind::UpdateTeam, "t1".into());
        assert!(filter(&store).should_deliver(&stale, &ev).await);
        assert_eq!(store.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn guest_sees_only_visible_users() {
        let store = Arc::new(InMemoryStore::new());
        store.hide_user("g".into(), "hidden".into());
        let f = filter(&store);
        let guest = state_for(user("g").as_guest());

        let visible = Event::to_all(EventKind::UserUpdated).with("user", json!({"id": "u1"}));
        let hidden = Event::to_all(EventKind::UserUpdated).with("user", json!({"id": "hidden"}));
        let new_hidden = Event::to_all(EventKind::NewUser).with("user_id", "hidden");
        let unrelated = Event::to_all(EventKind::EmojiAdded);
        let malformed = Event::to_all(EventKind::UserUpdated);

        assert!(f.should_deliver(&guest, &visible).await);
        assert!(!f.should_deliver(&guest, &hidden).await);
        assert!(!f.should_deliver(&guest, &new_hidden).await);
        assert!(f.should_deliver(&guest, &unrelated).await);
        assert!(!f.should_deliver(&guest, &malformed).await);

        // Regular users are not narrowed.
        assert!(f.should_deliver(&state_for(user("u2")), &hidden).await);
    }

    #[tokio::test]
    async fn guest_authorizer_failure_denies() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_authorizer(true);
        let ev = Event::to_all(EventKind::NewUser).with("user_id", "u1");
        let guest = state_for(user("g").as_guest());
        assert!(!filter(&store).should_deliver(&guest, &ev).await);
    }

    #[tokio::test]
    async fn untargeted_default_delivers() {
        let store = Arc::new(InMemoryStore::new());
        let ev = Event::to_all(EventKind::EmojiAdded);
        assert!(filter(&store).should_deliver(&state_for(user("u1")), &ev).await);
    }

    fn kind_strategy() -> impl Strategy<Value = EventKind> {
        prop_oneof![
            Just(EventKind::Posted),
            Just(EventKind::Typing),
            Just(EventKind::UserUpdated),
            Just(EventKind::NewUser),
            Just(EventKind::ConfigChanged),
        ]
    }

    proptest! {
        #[test]
        fn decision_is_deterministic(
            kind in kind_strategy(),
            target in 0u8..4,
            omit_self in any::<bool>(),
            sensitive in any::<bool>(),
            sanitized in any::<bool>(),
            admin in any::<bool>(),
            guest in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                store.set_memberships("u1".into(), ["c1".into()]);
                store.hide_user("u1".into(), "u9".into());
                let f = filter(&store);

                let mut ev = match target {
                    0 => Event::to_all(kind),
                    1 => Event::to_user(kind, "u1".into()),
                    2 => Event::to_channel(kind, "c1".into()),
                    _ => Event::to_team(kind, "t1".into()),
                };
                ev.add("user", json!({"id": "u9"}));
                ev.add("user_id", "u9");
                if omit_self { ev = ev.omit_users(["u1".into()]); }
                if sensitive { ev = ev.sensitive(); }
                if sanitized { ev = ev.sanitized(); }

                let mut session = user("u1").with_team("t1".into());
                if admin { session = session.with_roles(ROLE_SYSTEM_ADMIN); }
                if guest { session = session.as_guest(); }

                let first = f.should_deliver(&state_for(session.clone()), &ev).await;
                let second = f.should_deliver(&state_for(session), &ev).await;
                assert_eq!(first, second);
            });
        }
    }
}
