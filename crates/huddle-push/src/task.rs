//! Push tasks routed through the hub.

use huddle_core::ids::new_id;
use huddle_core::{ChannelId, PostId, TeamId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channel kind, as far as push text and redaction care.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    /// Public channel.
    #[default]
    #[serde(rename = "O")]
    Open,
    /// Private channel.
    #[serde(rename = "P")]
    Private,
    /// One-to-one direct message channel.
    #[serde(rename = "D")]
    Direct,
    /// Group message channel.
    #[serde(rename = "G")]
    Group,
}

/// The post that triggered a push.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostSnapshot {
    /// Post id.
    pub id: PostId,
    /// Author.
    pub user_id: UserId,
    /// Channel the post lives in.
    pub channel_id: ChannelId,
    /// Thread root, empty for root posts.
    #[serde(default)]
    pub root_id: String,
    /// Raw message text.
    #[serde(default)]
    pub message: String,
    /// Post type; `system_*` types never push.
    #[serde(default, rename = "type")]
    pub post_type: String,
    /// Attached file ids.
    #[serde(default)]
    pub file_ids: Vec<String>,
    /// Free-form post props (`override_username`, `from_webhook`, ...).
    #[serde(default)]
    pub props: Map<String, Value>,
}

impl PostSnapshot {
    /// Whether the post was generated by the system.
    pub fn is_system_message(&self) -> bool {
        self.post_type.starts_with("system_")
    }

    /// Whether files are attached.
    pub fn has_files(&self) -> bool {
        !self.file_ids.is_empty()
    }

    /// String prop, if present and a string.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }
}

/// The channel a post was made in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Channel id.
    pub id: ChannelId,
    /// Owning team, absent for direct and group channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    /// Kind.
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
}

/// Which thread a reply belongs to, relative to the recipient.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyThread {
    /// Not a reply the recipient is involved in.
    #[default]
    None,
    /// A reply to the recipient's own root post.
    Root,
    /// A reply in a thread the recipient participated in.
    Any,
}

/// Everything needed to render a message push.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDetails {
    /// Triggering post.
    pub post: PostSnapshot,
    /// Channel of the post.
    pub channel: ChannelSnapshot,
    /// Display name of the sender.
    pub sender_name: String,
    /// Display name of the channel.
    pub channel_name: String,
    /// The recipient was @-mentioned.
    pub explicit_mention: bool,
    /// The post used @channel/@all/@here.
    pub channel_wide_mention: bool,
    /// Thread involvement of the recipient.
    pub reply_to_thread: ReplyThread,
}

/// Variant-specific payload of a [`PushNotification`].
#[derive(Clone, Debug, PartialEq)]
pub enum PushKind {
    /// Reset the badge and clear delivered notifications for a channel.
    Clear,
    /// Deliver a new-message notification.
    Message(Box<MessageDetails>),
}

impl PushKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Message(_) => "message",
        }
    }
}

/// A unit of work for the push hub. Consumed exactly once by one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct PushNotification {
    /// Notification id, shared by every device payload it produces.
    pub id: String,
    /// Recipient.
    pub user_id: UserId,
    /// Channel the notification concerns.
    pub channel_id: ChannelId,
    /// Clear or message.
    pub kind: PushKind,
}

impl PushNotification {
    /// A badge-clear task for `channel_id`.
    pub fn clear(user_id: UserId, channel_id: ChannelId) -> Self {
        Self {
            id: new_id(),
            user_id,
            channel_id,
            kind: PushKind::Clear,
        }
    }

    /// A message task for `post` in `channel` addressed to `user_id`.
    pub fn message(user_id: UserId, post: PostSnapshot, channel: ChannelSnapshot) -> Self {
        Self {
            id: new_id(),
            user_id,
            channel_id: channel.id.clone(),
            kind: PushKind::Message(Box::new(MessageDetails {
                post,
                channel,
                sender_name: String::new(),
                channel_name: String::new(),
                explicit_mention: false,
                channel_wide_mention: false,
                reply_to_thread: ReplyThread::None,
            })),
        }
    }

    /// Builder: sender and channel display names.
    #[must_use]
    pub fn with_names(mut self, sender: impl Into<String>, channel: impl Into<String>) -> Self {
        if let PushKind::Message(details) = &mut self.kind {
            details.sender_name = sender.into();
            details.channel_name = channel.into();
        }
        self
    }

    /// Builder: mention flags.
    #[must_use]
    pub fn with_mentions(mut self, explicit: bool, channel_wide: bool) -> Self {
        if let PushKind::Message(details) = &mut self.kind {
            details.explicit_mention = explicit;
            details.channel_wide_mention = channel_wide;
        }
        self
    }

    /// Builder: thread involvement.
    #[must_use]
    pub fn with_reply(mut self, reply: ReplyThread) -> Self {
        if let PushKind::Message(details) = &mut self.kind {
            details.reply_to_thread = reply;
        }
        self
    }

    /// Post id for message tasks.
    pub fn post_id(&self) -> Option<&PostId> {
        match &self.kind {
            PushKind::Message(details) => Some(&details.post.id),
            PushKind::Clear => None,
        }
    }
}
