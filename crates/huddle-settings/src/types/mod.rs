//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial JSON
//! is accepted and missing fields take their production defaults.

mod push;
mod server;
mod websocket;

pub use push::*;
pub use server::*;
pub use websocket::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "websocket": { "ioMode": "blocking" },
///   "push": { "enabled": true, "serverUrl": "http://relay:8066" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HuddleSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Socket connection settings.
    pub websocket: WebSocketSettings,
    /// Push hub settings.
    pub push: PushSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl HuddleSettings {
    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.websocket;
        if ws.send_queue_size == 0 {
            return Err(invalid("websocket.sendQueueSize must be > 0"));
        }
        if ws.slow_warn_percent == 0 || ws.slow_warn_percent > 100 {
            return Err(invalid("websocket.slowWarnPercent must be in 1..=100"));
        }
        if ws.full_warn_percent < ws.slow_warn_percent || ws.full_warn_percent > 100 {
            return Err(invalid(
                "websocket.fullWarnPercent must be in slowWarnPercent..=100",
            ));
        }
        if ws.pong_wait_secs == 0 || ws.write_wait_secs == 0 {
            return Err(invalid("websocket deadlines must be > 0"));
        }
        if ws.max_message_size == 0 {
            return Err(invalid("websocket.maxMessageSize must be > 0"));
        }
        if ws.max_concurrent_reads == 0 {
            return Err(invalid("websocket.maxConcurrentReads must be > 0"));
        }
        if self.push.shard_count == 0 || self.push.shard_capacity == 0 {
            return Err(invalid("push.shardCount and push.shardCapacity must be > 0"));
        }
        if self.push.enabled && self.push.server_url.is_empty() {
            return Err(invalid("push.serverUrl is required when push is enabled"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` takes precedence).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
