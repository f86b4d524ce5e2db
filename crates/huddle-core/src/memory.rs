//! In-memory implementation of every collaborator trait.
//!
//! Backs the standalone daemon and the test suites. Failure injection flags
//! and call counters let tests exercise the degraded paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::StoreError;
use crate::ids::{ChannelId, SessionId, UserId};
use crate::session::Session;
use crate::store::{Authorizer, ChannelStore, SessionStore, UnreadStore};

/// Process-local store.
#[derive(Default)]
pub struct InMemoryStore {
    /// Sessions keyed by token.
    sessions: DashMap<String, Session>,
    memberships: DashMap<UserId, HashSet<ChannelId>>,
    /// `(viewer, target)` pairs that are NOT allowed to see each other.
    hidden: DashMap<(UserId, UserId), ()>,
    unread: DashMap<UserId, u64>,
    fail_sessions: AtomicBool,
    fail_memberships: AtomicBool,
    fail_unread: AtomicBool,
    fail_authorizer: AtomicBool,
    resolve_calls: AtomicUsize,
    membership_calls: AtomicUsize,
    cache_clears: AtomicUsize,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session.
    pub fn put_session(&self, session: Session) {
        let _ = self.sessions.insert(session.token.clone(), session);
    }

    /// Remove a session by token.
    pub fn revoke_session(&self, token: &str) {
        let _ = self.sessions.remove(token);
    }

    /// Look up a session by id.
    pub fn session_by_id(&self, id: &SessionId) -> Option<Session> {
        self.sessions
            .iter()
            .find(|entry| &entry.value().id == id)
            .map(|entry| entry.value().clone())
    }

    /// Replace the channel memberships of `user_id`.
    pub fn set_memberships(&self, user_id: UserId, channels: impl IntoIterator<Item = ChannelId>) {
        let _ = self
            .memberships
            .insert(user_id, channels.into_iter().collect());
    }

    /// Forbid `viewer` from seeing `target`.
    pub fn hide_user(&self, viewer: UserId, target: UserId) {
        let _ = self.hidden.insert((viewer, target), ());
    }

    /// Set the unread count of `user_id`.
    pub fn set_unread(&self, user_id: UserId, count: u64) {
        let _ = self.unread.insert(user_id, count);
    }

    /// Make session lookups fail with `Unavailable`.
    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    /// Make membership lookups fail with `Unavailable`.
    pub fn fail_memberships(&self, fail: bool) {
        self.fail_memberships.store(fail, Ordering::SeqCst);
    }

    /// Make unread lookups fail with `Unavailable`.
    pub fn fail_unread(&self, fail: bool) {
        self.fail_unread.store(fail, Ordering::SeqCst);
    }

    /// Make authorization checks fail with `Unavailable`.
    pub fn fail_authorizer(&self, fail: bool) {
        self.fail_authorizer.store(fail, Ordering::SeqCst);
    }

    /// Number of `resolve_session` calls so far.
    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    /// Number of `all_channel_memberships` calls so far.
    pub fn membership_calls(&self) -> usize {
        self.membership_calls.load(Ordering::SeqCst)
    }

    /// Number of `clear_session_cache_for_user` calls so far.
    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{what} backend down")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn resolve_session(&self, token: &str) -> Result<Session, StoreError> {
        let _ = self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_sessions, "session")?;
        match self.sessions.get(token) {
            Some(s) if !s.is_expired() => Ok(s.clone()),
            _ => Err(StoreError::NotFound {
                entity: "session",
                id: token.to_owned(),
            }),
        }
    }

    async fn sessions_with_active_device(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Session>, StoreError> {
        Self::check(&self.fail_sessions, "session")?;
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| &entry.user_id == user_id && entry.has_device())
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn attach_device_id(
        &self,
        session_id: &SessionId,
        device_id: &str,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_sessions, "session")?;
        let mut entry = self
            .sessions
            .iter_mut()
            .find(|entry| &entry.id == session_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "session",
                id: session_id.to_string(),
            })?;
        device_id.clone_into(&mut entry.device_id);
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn clear_session_cache_for_user(&self, _user_id: &UserId) {
        let _ = self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelStore for InMemoryStore {
    async fn all_channel_memberships(
        &self,
        user_id: &UserId,
    ) -> Result<HashSet<ChannelId>, StoreError> {
        let _ = self.membership_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_memberships, "membership")?;
        Ok(self
            .memberships
            .get(user_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Authorizer for InMemoryStore {
    async fn can_user_see_user(
        &self,
        viewer: &UserId,
        target: &UserId,
    ) -> Result<bool, StoreError> {
        Self::check(&self.fail_authorizer, "authorization")?;
        Ok(viewer == target || !self.hidden.contains_key(&(viewer.clone(), target.clone())))
    }
}

#[async_trait]
impl UnreadStore for InMemoryStore {
    async fn unread_count(&self, user_id: &UserId) -> Result<u64, StoreError> {
        Self::check(&self.fail_unread, "unread")?;
        Ok(self.unread.get(user_id).map_or(0, |c| *c))
    }
}
