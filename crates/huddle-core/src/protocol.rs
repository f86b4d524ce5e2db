//! Client request and response envelopes for the socket protocol.
//!
//! Inbound text frames carry `{"action": "...", "seq": N, "data": {...}}`.
//! Replies carry `{"status": "OK"|"FAIL", "seq_reply": N, "data"?, "error"?}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `status` value of a successful reply.
pub const STATUS_OK: &str = "OK";
/// `status` value of a failed reply.
pub const STATUS_FAIL: &str = "FAIL";

/// Inbound action: authenticate an anonymous connection with a token.
pub const ACTION_AUTHENTICATION_CHALLENGE: &str = "authentication_challenge";
/// Inbound action: application-level ping.
pub const ACTION_PING: &str = "ping";
/// Inbound action: the user is typing in a channel.
pub const ACTION_USER_TYPING: &str = "user_typing";

/// Error id: the action is not routed.
pub const ERR_BAD_ACTION: &str = "api.web_socket_router.bad_action.app_error";
/// Error id: missing or non-positive sequence number.
pub const ERR_NO_SEQ: &str = "api.web_socket_router.no_seq.app_error";
/// Error id: request requires an authenticated connection.
pub const ERR_NOT_AUTHENTICATED: &str = "api.web_socket_router.not_authenticated.app_error";
/// Error id: the frame did not decode as a request envelope.
pub const ERR_BAD_JSON: &str = "api.web_socket_router.bad_json.app_error";
/// Error id: the frame exceeded the maximum message size.
pub const ERR_TOO_LARGE: &str = "api.web_socket_router.too_large.app_error";
/// Error id: a required field in `data` is missing or malformed.
pub const ERR_BAD_PARAMS: &str = "api.web_socket_handler.invalid_param.app_error";
/// Error id: authentication challenge token was rejected.
pub const ERR_BAD_TOKEN: &str = "api.web_socket_router.bad_token.app_error";

/// A decoded client request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Request type, used for routing.
    pub action: String,
    /// Client-chosen sequence number echoed in the reply.
    #[serde(default)]
    pub seq: i64,
    /// Action parameters.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ClientRequest {
    /// Build a request.
    pub fn new(action: impl Into<String>, seq: i64) -> Self {
        Self {
            action: action.into(),
            seq,
            data: Map::new(),
        }
    }

    /// Add a `data` field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.data.insert(key.into(), value.into());
        self
    }

    /// String parameter from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Error body of a failed reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine-readable error id (one of the `ERR_*` constants).
    pub id: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP-like status code classifying the error.
    pub status_code: u16,
    /// Location that raised the error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#where: String,
}

impl AppError {
    /// Build an error body.
    pub fn new(
        r#where: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            status_code,
            r#where: r#where.into(),
        }
    }
}

/// A reply to a [`ClientRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// [`STATUS_OK`] or [`STATUS_FAIL`].
    pub status: String,
    /// Sequence number of the request being answered.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq_reply: i64,
    /// Reply payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Error body (failed replies only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl ClientResponse {
    /// Successful reply with an optional payload.
    pub fn ok(seq_reply: i64, data: Option<Map<String, Value>>) -> Self {
        Self {
            status: STATUS_OK.to_owned(),
            seq_reply,
            data,
            error: None,
        }
    }

    /// Failed reply.
    pub fn error(seq_reply: i64, error: AppError) -> Self {
        Self {
            status: STATUS_FAIL.to_owned(),
            seq_reply,
            data: None,
            error: Some(error),
        }
    }

    /// Whether the reply reports success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Error id, if the reply failed.
    pub fn error_id(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.id.as_str())
    }
}
