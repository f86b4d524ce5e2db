//! # huddle-push
//!
//! Push Notification Hub: decouples mobile push delivery from the request
//! path that triggers it.
//!
//! - [`PushHub`]: fixed array of bounded queues, one worker each, routed by
//!   a stable hash of the user id
//! - [`PushSender`]: builds the payload, computes the badge, posts once per
//!   live device session, and handles `REMOVE`/`FAIL` verdicts without retry
//! - [`RelayClient`] / [`HttpRelayClient`]: the push relay seam
//! - [`PushObserver`]: enqueue/send/failure hooks
//! - [`message`] and [`policy`]: notification text and send eligibility

#![deny(unsafe_code)]

pub mod errors;
pub mod hub;
pub mod message;
pub mod observer;
pub mod policy;
pub mod relay;
pub mod sender;
pub mod task;
pub mod wire;
pub mod worker;

pub use errors::{PushError, RelayError};
pub use hub::{PushHub, shard_for};
pub use observer::{NoopObserver, PushObserver};
pub use relay::{HttpRelayClient, RelayClient};
pub use sender::{DeliveryReport, PushSender, SendOutcome};
pub use task::{
    ChannelSnapshot, ChannelType, MessageDetails, PostSnapshot, PushKind, PushNotification,
    ReplyThread,
};
pub use wire::{PushAck, PushMessage, PushResponse, RelayStatus};
