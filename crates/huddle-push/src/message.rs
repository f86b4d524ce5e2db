//! Notification text and channel-name redaction.

use huddle_settings::PushContents;

use crate::task::{ChannelType, MessageDetails, ReplyThread};

const IMAGE_ONLY: &str = " attached a file.";
const DIRECT_MESSAGE: &str = "sent you a message.";
const CHANNEL_MENTION: &str = " notified the channel.";
const EXPLICIT_MENTION: &str = " mentioned you.";
const COMMENT_ON_POST: &str = " commented on your post.";
const COMMENT_ON_THREAD: &str = " commented on a thread you participated in.";
const GENERAL_MESSAGE: &str = " posted a message.";

/// Strip `<mention>` markup from a post message.
pub fn clear_mention_tags(message: &str) -> String {
    message.replace("<mention>", "").replace("</mention>", "")
}

/// Render the notification body for `details` under `contents`.
pub fn notification_text(details: &MessageDetails, contents: PushContents) -> String {
    let post = &details.post;
    let sender = &details.sender_name;
    let direct = details.channel.channel_type == ChannelType::Direct;

    if post.message.is_empty() && post.has_files() {
        if direct {
            return IMAGE_ONLY.trim().to_string();
        }
        return format!("@{sender}{IMAGE_ONLY}");
    }

    if contents == PushContents::Full {
        let text = clear_mention_tags(&post.message);
        if direct {
            return text;
        }
        return format!("@{sender}: {text}");
    }

    if direct {
        return DIRECT_MESSAGE.to_string();
    }

    let suffix = if details.channel_wide_mention {
        CHANNEL_MENTION
    } else if details.explicit_mention {
        EXPLICIT_MENTION
    } else {
        match details.reply_to_thread {
            ReplyThread::Root => COMMENT_ON_POST,
            ReplyThread::Any => COMMENT_ON_THREAD,
            ReplyThread::None => GENERAL_MESSAGE,
        }
    };
    format!("@{sender}{suffix}")
}

/// Channel name to put in the payload, or empty when redacted.
///
/// `generic_no_channel` only names direct channels.
pub fn visible_channel_name(details: &MessageDetails, contents: PushContents) -> String {
    if contents != PushContents::GenericNoChannel
        || details.channel.channel_type == ChannelType::Direct
    {
        details.channel_name.clone()
    } else {
        String::new()
    }
}
