//! Push notification relay settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How much of a post leaks into the push payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushContents {
    /// Sender, channel, and message text.
    #[default]
    Full,
    /// Generic description with channel name.
    Generic,
    /// Generic description, channel name only for direct messages.
    GenericNoChannel,
}

/// Push hub and relay settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Whether push notifications are sent at all.
    pub enabled: bool,
    /// Base URL of the push relay.
    pub server_url: String,
    /// Number of worker queues.
    pub shard_count: usize,
    /// Capacity of each worker queue.
    pub shard_capacity: usize,
    /// HTTP timeout for relay calls, in seconds.
    pub request_timeout_secs: u64,
    /// Payload contents mode.
    pub contents: PushContents,
    /// Identifier of this server, sent with every payload.
    pub server_id: String,
    /// Copy `override_username` from post props.
    pub enable_username_override: bool,
    /// Copy `override_icon_url` from post props.
    pub enable_icon_override: bool,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: "https://push.huddle.chat".to_string(),
            shard_count: 1000,
            shard_capacity: 50,
            request_timeout_secs: 30,
            contents: PushContents::Full,
            server_id: String::new(),
            enable_username_override: false,
            enable_icon_override: false,
        }
    }
}

impl PushSettings {
    /// Relay request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_wire_names() {
        let c: PushContents = serde_json::from_str(r#""generic_no_channel""#).unwrap();
        assert_eq!(c, PushContents::GenericNoChannel);
        assert_eq!(
            serde_json::to_string(&PushContents::Generic).unwrap(),
            r#""generic""#
        );
    }

    #[test]
    fn defaults() {
        let p = PushSettings::default();
        assert!(!p.enabled);
        assert_eq!(p.request_timeout(), Duration::from_secs(30));
    }
}
