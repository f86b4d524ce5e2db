//! JSON bodies exchanged with the push relay.

use serde::{Deserialize, Serialize};

/// Path prefix of the relay API.
pub const API_URL_SUFFIX_V1: &str = "/api/v1";
/// `type` of a new-message payload.
pub const PUSH_TYPE_MESSAGE: &str = "message";
/// `type` of a badge-clear payload.
pub const PUSH_TYPE_CLEAR: &str = "clear";
/// Payload schema version.
pub const PUSH_MESSAGE_V2: &str = "v2";
/// Notification category enabling inline reply on the device.
pub const CATEGORY_CAN_REPLY: &str = "CAN_REPLY";

/// One device payload posted to `/api/v1/send_push`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Notification id shared by every device payload of one task.
    pub id: String,
    /// Per-device id the client acknowledges.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ack_id: String,
    /// Device platform (`apple`, `android_rn`, ...).
    #[serde(default)]
    pub platform: String,
    /// Identifier of the sending server.
    #[serde(default)]
    pub server_id: String,
    /// Vendor device token.
    #[serde(default)]
    pub device_id: String,
    /// `message` or `clear`.
    #[serde(rename = "type")]
    pub push_type: String,
    /// Payload schema version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Notification category.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    /// Rendered notification text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Unread badge.
    pub badge: u64,
    /// iOS `content-available` flag.
    #[serde(default)]
    pub content_available: u8,
    /// Team of the channel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team_id: String,
    /// Channel the notification concerns.
    #[serde(default)]
    pub channel_id: String,
    /// Channel display name (may be redacted).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_name: String,
    /// Triggering post.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_id: String,
    /// Thread root of the triggering post.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_id: String,
    /// Author of the triggering post.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,
    /// Display name of the author.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_name: String,
    /// Username override from post props.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub override_username: String,
    /// Icon override from post props.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub override_icon_url: String,
    /// `"true"` when the post came from a webhook.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_webhook: String,
}

impl PushMessage {
    /// Target a `platform:token` device id.
    pub fn set_device(&mut self, platform: &str, device_token: &str) {
        platform.clone_into(&mut self.platform);
        device_token.clone_into(&mut self.device_id);
    }

    /// Serialize for the relay.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Relay verdict, kept as an opaque status string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// `OK`, `REMOVE`, `FAIL`, or anything else the relay invents.
    #[serde(default)]
    pub status: String,
    /// Relay-specific error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classified relay status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayStatus {
    /// Delivered to the vendor.
    Ok,
    /// The device token is gone; stop sending to it.
    Remove,
    /// Delivery failed.
    Fail,
    /// Unrecognized or empty status; treated as delivered.
    Other,
}

impl PushResponse {
    /// `OK` status.
    pub const OK: &'static str = "OK";
    /// `REMOVE` status.
    pub const REMOVE: &'static str = "REMOVE";
    /// `FAIL` status.
    pub const FAIL: &'static str = "FAIL";

    /// A response with `status`.
    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            error: None,
        }
    }

    /// Classify the status string.
    pub fn classify(&self) -> RelayStatus {
        match self.status.as_str() {
            Self::OK => RelayStatus::Ok,
            Self::REMOVE => RelayStatus::Remove,
            Self::FAIL => RelayStatus::Fail,
            _ => RelayStatus::Other,
        }
    }
}

/// Delivery acknowledgement posted to `/api/v1/ack`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// The `ack_id` of the payload being acknowledged.
    pub id: String,
    /// Device platform.
    #[serde(default)]
    pub platform: String,
    /// `message` or `clear`.
    #[serde(default, rename = "type")]
    pub notification_type: String,
    /// Post the payload was about.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_id: String,
    /// Device receipt time, Unix milliseconds.
    #[serde(default)]
    pub received_at: i64,
}
