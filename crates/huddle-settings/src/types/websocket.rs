//! Per-connection socket tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Socket I/O strategy selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Evented when the platform supports it and TLS is off, blocking otherwise.
    #[default]
    Auto,
    /// Single task multiplexing reads and writes.
    Evented,
    /// Separate read loop and write task.
    Blocking,
}

impl IoMode {
    /// Parse a mode name (`auto`, `evented`, `blocking`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "evented" => Some(Self::Evented),
            "blocking" => Some(Self::Blocking),
            _ => None,
        }
    }
}

/// WebSocket connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Capacity of each connection's outbound queue.
    pub send_queue_size: usize,
    /// Queue fill percentage at which droppable events are discarded.
    pub slow_warn_percent: u8,
    /// Queue fill percentage at which a warning is logged.
    pub full_warn_percent: u8,
    /// Event types discarded once the queue is past the slow mark.
    pub droppable_events: Vec<String>,
    /// Deadline for a single frame write, in seconds.
    pub write_wait_secs: u64,
    /// Read deadline; also drives the ping interval (60%).
    pub pong_wait_secs: u64,
    /// Grace period for a connection without a token, in seconds.
    pub auth_grace_secs: u64,
    /// Lifetime of a connection's channel membership cache, in seconds.
    pub member_cache_ttl_secs: u64,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: usize,
    /// I/O strategy.
    pub io_mode: IoMode,
    /// Server-wide bound on concurrently dispatched reads in evented mode.
    pub max_concurrent_reads: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            send_queue_size: 256,
            slow_warn_percent: 50,
            full_warn_percent: 95,
            droppable_events: vec![
                "typing".to_string(),
                "status_change".to_string(),
                "channel_viewed".to_string(),
            ],
            write_wait_secs: 30,
            pong_wait_secs: 100,
            auth_grace_secs: 5,
            member_cache_ttl_secs: 1800,
            max_message_size: 8 * 1024,
            io_mode: IoMode::Auto,
            max_concurrent_reads: 1024,
        }
    }
}

impl WebSocketSettings {
    /// Single frame write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Read deadline.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Keep-alive ping period, 60% of the read deadline.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.pong_wait_secs * 600)
    }

    /// Unauthenticated grace period.
    pub fn auth_grace(&self) -> Duration {
        Duration::from_secs(self.auth_grace_secs)
    }

    /// Membership cache lifetime.
    pub fn member_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.member_cache_ttl_secs)
    }

    /// Queue length at which droppable events are discarded.
    pub fn slow_threshold(&self) -> usize {
        percent_of(self.send_queue_size, self.slow_warn_percent)
    }

    /// Queue length at which the write loop warns.
    pub fn full_threshold(&self) -> usize {
        percent_of(self.send_queue_size, self.full_warn_percent)
    }
}

fn percent_of(size: usize, percent: u8) -> usize {
    size * usize::from(percent) / 100
}
