//! Contracts of the external collaborators the fan-out subsystem consumes.
//!
//! The persistent store, session layer, and authorization engine live outside
//! this workspace. Connections and push workers only see these traits, which
//! are object-safe and shared as `Arc<dyn _>`.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::ids::{ChannelId, SessionId, UserId};
use crate::session::{ROLE_SYSTEM_ADMIN, Session};

/// Session lookups and device bookkeeping.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a bearer token to a live (non-expired) session.
    async fn resolve_session(&self, token: &str) -> Result<Session, StoreError>;

    /// Sessions of `user_id` that have a mobile device attached.
    ///
    /// May include expired sessions; callers filter.
    async fn sessions_with_active_device(&self, user_id: &UserId)
    -> Result<Vec<Session>, StoreError>;

    /// Replace the device id stored on a session (empty string detaches).
    async fn attach_device_id(
        &self,
        session_id: &SessionId,
        device_id: &str,
        expires_at: i64,
    ) -> Result<(), StoreError>;

    /// Drop any cached sessions of `user_id`.
    async fn clear_session_cache_for_user(&self, _user_id: &UserId) {}
}

/// Channel membership lookups.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Every channel `user_id` is a member of.
    async fn all_channel_memberships(
        &self,
        user_id: &UserId,
    ) -> Result<HashSet<ChannelId>, StoreError>;
}

/// Authorization decisions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `viewer` may see the profile of `target`.
    async fn can_user_see_user(&self, viewer: &UserId, target: &UserId)
    -> Result<bool, StoreError>;

    /// Whether the session's roles grant the "see private data" capability.
    fn can_see_private_data(&self, session: &Session) -> bool {
        session.has_role(ROLE_SYSTEM_ADMIN)
    }
}

/// Unread counts used for push badges.
#[async_trait]
pub trait UnreadStore: Send + Sync {
    /// Total unread mentions/messages for `user_id`.
    async fn unread_count(&self, user_id: &UserId) -> Result<u64, StoreError>;
}
