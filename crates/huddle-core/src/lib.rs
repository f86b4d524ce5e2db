//! # huddle-core
//!
//! Foundation types shared by every huddle crate:
//!
//! - **Branded IDs**: `UserId`, `ChannelId`, `TeamId`, `SessionId`, `ConnectionId`
//! - **Events**: [`events::Event`] with its [`events::Broadcast`] target and
//!   sensitivity flags, plus the pre-serialized [`events::PreparedEvent`]
//! - **Protocol**: client request/response envelopes for the socket protocol
//! - **Sessions**: the authenticated session snapshot a connection caches
//! - **Collaborators**: async traits for the session, membership, authorization,
//!   and unread-count stores, with an in-memory implementation
//! - **Errors** and **logging** setup

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod store;

pub use errors::StoreError;
pub use ids::{ChannelId, ConnectionId, PostId, SessionId, TeamId, UserId};

/// Current wall-clock time in Unix milliseconds.
///
/// Session expiry and push timestamps are expressed in this unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
