//! Client request routing.
//!
//! Requests are checked in a fixed order before reaching a handler:
//! a positive `seq`, then authentication (with `authentication_challenge`
//! as the only action open to anonymous connections), then a registered
//! handler for the action.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use huddle_core::events::{Event, EventKind};
use huddle_core::protocol::{
    ACTION_AUTHENTICATION_CHALLENGE, ACTION_PING, ACTION_USER_TYPING, AppError, ClientRequest,
    ClientResponse, ERR_BAD_ACTION, ERR_BAD_PARAMS, ERR_BAD_TOKEN, ERR_NO_SEQ,
    ERR_NOT_AUTHENTICATED,
};

use super::connection::WebConn;
use super::hub::Hub;

/// What a handler sees of the world.
pub struct ActionContext<'a> {
    /// The hub the connection belongs to.
    pub hub: &'a Arc<Hub>,
    /// The requesting connection.
    pub conn: &'a Arc<WebConn>,
}

/// Handler for one client action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handle an authenticated request. `Ok(None)` replies `OK` with no data.
    async fn handle(
        &self,
        request: &ClientRequest,
        ctx: &ActionContext<'_>,
    ) -> Result<Option<Map<String, Value>>, AppError>;
}

/// Maps action names to handlers.
pub struct ActionRouter {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRouter {
    /// An empty router. Authentication challenges are always handled.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A router with `ping` and `user_typing`.
    pub fn with_builtins() -> Self {
        let mut router = Self::new();
        router.register(ACTION_PING, PingAction);
        router.register(ACTION_USER_TYPING, UserTypingAction);
        router
    }

    /// Register a handler, replacing any previous one for `action`.
    pub fn register(&mut self, action: impl Into<String>, handler: impl ActionHandler + 'static) {
        let _ = self.handlers.insert(action.into(), Arc::new(handler));
    }

    /// Whether `action` is routable.
    pub fn has_action(&self, action: &str) -> bool {
        action == ACTION_AUTHENTICATION_CHALLENGE || self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route `request` and enqueue the reply on the requesting connection.
    ///
    /// A successful authentication challenge is followed by `hello`,
    /// enqueued after the reply. A rejected one closes the connection once
    /// the reply is written.
    #[instrument(skip_all, fields(conn_id = %ctx.conn.id(), action = %request.action, seq = request.seq))]
    pub async fn dispatch(&self, request: ClientRequest, ctx: &ActionContext<'_>) -> ClientResponse {
        counter!("ws_requests_total", "action" => request.action.clone()).increment(1);
        let was_authenticated = ctx.conn.state().has_session();
        let response = self.route(&request, ctx).await;
        if !response.is_ok() {
            debug!(error = ?response.error_id(), "request failed");
        }
        let _ = ctx.conn.send_response(response.clone());

        if request.action == ACTION_AUTHENTICATION_CHALLENGE && !was_authenticated {
            if response.is_ok() {
                ctx.hub.on_authenticated(ctx.conn);
            } else if matches!(response.error_id(), Some(ERR_BAD_TOKEN | ERR_BAD_PARAMS)) {
                ctx.conn.close_after_flush();
            }
        }
        response
    }

    async fn route(&self, request: &ClientRequest, ctx: &ActionContext<'_>) -> ClientResponse {
        let seq = request.seq;
        if seq <= 0 {
            return ClientResponse::error(
                seq,
                AppError::new(
                    "ActionRouter.route",
                    ERR_NO_SEQ,
                    "request is missing a positive seq",
                    400,
                ),
            );
        }

        if request.action == ACTION_AUTHENTICATION_CHALLENGE {
            return authenticate(request, ctx).await;
        }

        if !ctx
            .conn
            .state()
            .is_authenticated(ctx.hub.sessions().as_ref())
            .await
        {
            return ClientResponse::error(
                seq,
                AppError::new(
                    "ActionRouter.route",
                    ERR_NOT_AUTHENTICATED,
                    "connection is not authenticated",
                    401,
                ),
            );
        }

        let Some(handler) = self.handlers.get(&request.action) else {
            warn!("unknown websocket action");
            return ClientResponse::error(
                seq,
                AppError::new(
                    "ActionRouter.route",
                    ERR_BAD_ACTION,
                    format!("unknown action {:?}", request.action),
                    501,
                ),
            );
        };

        match handler.handle(request, ctx).await {
            Ok(data) => ClientResponse::ok(seq, data),
            Err(e) => ClientResponse::error(seq, e),
        }
    }
}

impl Default for ActionRouter {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// `authentication_challenge`: bind a session to an anonymous connection.
///
/// A missing or bad token is answered with an error and the connection is
/// closed after the reply.
async fn authenticate(request: &ClientRequest, ctx: &ActionContext<'_>) -> ClientResponse {
    let seq = request.seq;
    let state = ctx.conn.state();
    if state.has_session() {
        return ClientResponse::ok(seq, None);
    }
    let Some(token) = request.data_str("token").filter(|t| !t.is_empty()) else {
        return ClientResponse::error(
            seq,
            AppError::new(
                "authenticate",
                ERR_BAD_PARAMS,
                "missing data.token",
                400,
            ),
        );
    };

    match ctx.hub.sessions().resolve_session(token).await {
        Ok(session) => {
            info!(user_id = %session.user_id, "websocket connection authenticated");
            state.install(session);
            ClientResponse::ok(seq, None)
        }
        Err(e) => {
            debug!(error = %e, "authentication challenge rejected");
            ClientResponse::error(
                seq,
                AppError::new("authenticate", ERR_BAD_TOKEN, "invalid or expired token", 401),
            )
        }
    }
}

/// `ping`: liveness probe at the application level.
struct PingAction;

#[async_trait]
impl ActionHandler for PingAction {
    async fn handle(
        &self,
        _request: &ClientRequest,
        ctx: &ActionContext<'_>,
    ) -> Result<Option<Map<String, Value>>, AppError> {
        let mut data = Map::new();
        let _ = data.insert("text".into(), json!("pong"));
        let _ = data.insert("version".into(), json!(ctx.hub.server_version()));
        let _ = data.insert("server_time".into(), json!(huddle_core::now_millis()));
        Ok(Some(data))
    }
}

/// `user_typing`: tell the rest of a channel the sender is typing.
struct UserTypingAction;

#[async_trait]
impl ActionHandler for UserTypingAction {
    async fn handle(
        &self,
        request: &ClientRequest,
        ctx: &ActionContext<'_>,
    ) -> Result<Option<Map<String, Value>>, AppError> {
        let Some(channel_id) = request.data_str("channel_id").filter(|c| !c.is_empty()) else {
            return Err(AppError::new(
                "UserTypingAction.handle",
                ERR_BAD_PARAMS,
                "invalid channel_id",
                400,
            ));
        };
        let Some(user_id) = ctx.conn.user_id() else {
            return Err(AppError::new(
                "UserTypingAction.handle",
                ERR_NOT_AUTHENTICATED,
                "connection is not authenticated",
                401,
            ));
        };
        let parent_id = request.data_str("parent_id").unwrap_or_default();

        let event = Event::to_channel(EventKind::Typing, channel_id.into())
            .omit_users([user_id.clone()])
            .with("parent_id", parent_id)
            .with("user_id", user_id.as_str());
        ctx.hub.publish(event);
        Ok(None)
    }
}
