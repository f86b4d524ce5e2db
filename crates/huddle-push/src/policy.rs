//! Whether a post warrants a push notification for a given recipient.
//!
//! Producers consult these before enqueuing a message task.

use std::collections::HashMap;

use huddle_core::UserId;

use crate::task::PostSnapshot;

/// Notify prop holding the push preference.
pub const PUSH_NOTIFY_PROP: &str = "push";
/// User notify prop holding the presence threshold for pushes.
pub const PUSH_STATUS_NOTIFY_PROP: &str = "push_status";
/// Channel notify prop holding the mute setting.
pub const MARK_UNREAD_NOTIFY_PROP: &str = "mark_unread";

/// Defer to the user-level setting.
pub const NOTIFY_DEFAULT: &str = "default";
/// Notify for every message.
pub const NOTIFY_ALL: &str = "all";
/// Notify on mentions only (also the "muted" value of `mark_unread`).
pub const NOTIFY_MENTION: &str = "mention";
/// Never notify.
pub const NOTIFY_NONE: &str = "none";

/// Presence: online.
pub const STATUS_ONLINE: &str = "online";
/// Presence: away.
pub const STATUS_AWAY: &str = "away";
/// Presence: offline.
pub const STATUS_OFFLINE: &str = "offline";
/// Presence: do not disturb.
pub const STATUS_DND: &str = "dnd";
/// Presence: out of office.
pub const STATUS_OUT_OF_OFFICE: &str = "ooo";

/// Activity older than this (ms) no longer counts as viewing the channel.
pub const STATUS_CHANNEL_TIMEOUT_MS: i64 = 20_000;

/// A user's presence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceStatus {
    /// One of the `STATUS_*` values.
    pub status: String,
    /// Channel the user last had open.
    pub active_channel: String,
    /// Last activity, Unix milliseconds.
    pub last_activity_at: i64,
}

/// Notify-prop check: mute, system posts, and push levels.
pub fn notify_props_allow_push(
    recipient: &UserId,
    user_props: &HashMap<String, String>,
    channel_props: &HashMap<String, String>,
    post: &PostSnapshot,
    was_mentioned: bool,
) -> bool {
    let user_notify = user_props.get(PUSH_NOTIFY_PROP).map_or("", String::as_str);
    let channel_notify = match channel_props.get(PUSH_NOTIFY_PROP).map(String::as_str) {
        None | Some("") => NOTIFY_DEFAULT,
        Some(v) => v,
    };

    if channel_props.get(MARK_UNREAD_NOTIFY_PROP).map(String::as_str) == Some(NOTIFY_MENTION) {
        return false;
    }
    if post.is_system_message() {
        return false;
    }
    if channel_notify == NOTIFY_NONE {
        return false;
    }
    if channel_notify == NOTIFY_MENTION && !was_mentioned {
        return false;
    }
    if user_notify == NOTIFY_MENTION && channel_notify == NOTIFY_DEFAULT && !was_mentioned {
        return false;
    }
    if (user_notify == NOTIFY_ALL || channel_notify == NOTIFY_ALL)
        && (&post.user_id != recipient || post.prop_str("from_webhook") == Some("true"))
    {
        return true;
    }
    if user_notify == NOTIFY_NONE && channel_notify == NOTIFY_DEFAULT {
        return false;
    }
    true
}

/// Presence check: DND/OOO suppress, otherwise the `push_status` threshold applies.
pub fn status_allows_push(
    user_props: &HashMap<String, String>,
    status: &PresenceStatus,
    channel_id: &str,
    now_millis: i64,
) -> bool {
    if status.status == STATUS_DND || status.status == STATUS_OUT_OF_OFFICE {
        return false;
    }

    let push_status = user_props.get(PUSH_STATUS_NOTIFY_PROP).map(String::as_str);
    let viewing_channel = status.active_channel == channel_id
        && now_millis - status.last_activity_at <= STATUS_CHANNEL_TIMEOUT_MS;

    if matches!(push_status, None | Some(STATUS_ONLINE)) && !viewing_channel {
        return true;
    }
    if push_status == Some(STATUS_AWAY)
        && (status.status == STATUS_AWAY || status.status == STATUS_OFFLINE)
    {
        return true;
    }
    push_status == Some(STATUS_OFFLINE) && status.status == STATUS_OFFLINE
}

/// Both checks.
pub fn should_send_push(
    recipient: &UserId,
    user_props: &HashMap<String, String>,
    channel_props: &HashMap<String, String>,
    was_mentioned: bool,
    status: &PresenceStatus,
    post: &PostSnapshot,
    now_millis: i64,
) -> bool {
    notify_props_allow_push(recipient, user_props, channel_props, post, was_mentioned)
        && status_allows_push(user_props, status, post.channel_id.as_str(), now_millis)
}
