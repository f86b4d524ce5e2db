//! Push hub and relay error types.

use huddle_core::StoreError;
use thiserror::Error;

/// Errors talking to the push relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Building or sending the HTTP request failed (connect, timeout, TLS).
    #[error("relay request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The relay answered with a non-success HTTP status.
    #[error("relay returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The relay body was not a push response.
    #[error("relay response could not be decoded: {0}")]
    Decode(String),
}

/// Errors surfaced by the push hub and sender.
#[derive(Debug, Error)]
pub enum PushError {
    /// The hub was stopped; no further tasks are accepted.
    #[error("push hub is stopped")]
    HubStopped,
    /// A collaborator store lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The relay call failed.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl RelayError {
    /// Short label used as the `reason` metric tag.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Request(e) if e.is_timeout() => "timeout",
            Self::Request(_) => "transport",
            Self::Status { .. } => "http_status",
            Self::Decode(_) => "decode",
        }
    }
}
