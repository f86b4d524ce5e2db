//! Delivery of one push task to every device of its recipient.

use std::sync::Arc;

use huddle_core::ids::new_id;
use huddle_core::session::Session;
use huddle_core::store::{SessionStore, UnreadStore};
use huddle_core::{ChannelId, UserId};
use huddle_settings::PushSettings;
use metrics::counter;
use tracing::{debug, error, info};

use crate::errors::PushError;
use crate::message::{notification_text, visible_channel_name};
use crate::observer::PushObserver;
use crate::relay::RelayClient;
use crate::task::{MessageDetails, PushKind, PushNotification};
use crate::wire::{
    CATEGORY_CAN_REPLY, PUSH_MESSAGE_V2, PUSH_TYPE_CLEAR, PUSH_TYPE_MESSAGE, PushAck, PushMessage,
    RelayStatus,
};

/// Badge used when the unread count cannot be read for a message push.
const MESSAGE_BADGE_FALLBACK: u64 = 1;
/// Badge used when the unread count cannot be read for a clear push.
const CLEAR_BADGE_FALLBACK: u64 = 0;

/// Result of posting one device payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The relay accepted the payload.
    Sent,
    /// The observer suppressed the payload.
    Suppressed,
    /// The relay reported the device gone; its token was detached.
    DeviceRemoved,
    /// The relay reported failure.
    Failed(String),
}

/// Per-task delivery tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Payloads posted (expired sessions are not attempted).
    pub attempted: usize,
    /// Payloads accepted.
    pub sent: usize,
    /// Devices detached after `REMOVE`.
    pub removed: usize,
    /// Payloads that failed or errored.
    pub failed: usize,
}

/// Builds payloads and talks to the relay. Shared by every shard worker.
pub struct PushSender {
    sessions: Arc<dyn SessionStore>,
    unread: Arc<dyn UnreadStore>,
    relay: Arc<dyn RelayClient>,
    observer: Arc<dyn PushObserver>,
    settings: PushSettings,
}

impl PushSender {
    /// Create a sender.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        unread: Arc<dyn UnreadStore>,
        relay: Arc<dyn RelayClient>,
        observer: Arc<dyn PushObserver>,
        settings: PushSettings,
    ) -> Self {
        Self {
            sessions,
            unread,
            relay,
            observer,
            settings,
        }
    }

    /// The observer hooks.
    pub fn observer(&self) -> &Arc<dyn PushObserver> {
        &self.observer
    }

    /// Process one task. Failures are logged, never propagated to the worker.
    pub async fn process(&self, notification: PushNotification) -> DeliveryReport {
        let PushNotification {
            id,
            user_id,
            channel_id,
            kind,
        } = notification;
        let result = match kind {
            PushKind::Clear => self.send_clear(&id, &user_id, &channel_id).await,
            PushKind::Message(details) => self.send_message(&id, &user_id, &details).await,
        };
        result.unwrap_or_else(|e| {
            error!(notification_id = %id, user_id = %user_id, error = %e, "push task failed");
            DeliveryReport::default()
        })
    }

    /// Deliver a new-message notification to every live device of `user_id`.
    pub async fn send_message(
        &self,
        id: &str,
        user_id: &UserId,
        details: &MessageDetails,
    ) -> Result<DeliveryReport, PushError> {
        let sessions = self.sessions.sessions_with_active_device(user_id).await?;
        let badge = self.badge(user_id, MESSAGE_BADGE_FALLBACK).await;
        let post = &details.post;

        let mut msg = PushMessage {
            id: id.to_string(),
            push_type: PUSH_TYPE_MESSAGE.to_string(),
            version: PUSH_MESSAGE_V2.to_string(),
            category: CATEGORY_CAN_REPLY.to_string(),
            badge,
            team_id: details
                .channel
                .team_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            channel_id: details.channel.id.to_string(),
            channel_name: visible_channel_name(details, self.settings.contents),
            post_id: post.id.to_string(),
            root_id: post.root_id.clone(),
            sender_id: post.user_id.to_string(),
            sender_name: details.sender_name.clone(),
            message: notification_text(details, self.settings.contents),
            ..PushMessage::default()
        };
        if self.settings.enable_username_override {
            if let Some(name) = post.prop_str("override_username") {
                name.clone_into(&mut msg.override_username);
            }
        }
        if self.settings.enable_icon_override {
            if let Some(url) = post.prop_str("override_icon_url") {
                url.clone_into(&mut msg.override_icon_url);
            }
        }
        if let Some(from_webhook) = post.prop_str("from_webhook") {
            from_webhook.clone_into(&mut msg.from_webhook);
        }

        let mut report = DeliveryReport::default();
        for session in &sessions {
            if session.is_expired() {
                continue;
            }
            let mut device_msg = msg.clone();
            let (platform, token) = session.device_platform();
            device_msg.set_device(platform, token);
            device_msg.ack_id = new_id();
            debug!(
                notification_id = %device_msg.id,
                ack_id = %device_msg.ack_id,
                device_id = %device_msg.device_id,
                user_id = %user_id,
                "sending push notification"
            );
            self.deliver(device_msg, session, &mut report).await;
        }
        Ok(report)
    }

    /// Reset the badge of every device of `user_id` for `channel_id`.
    pub async fn send_clear(
        &self,
        id: &str,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Result<DeliveryReport, PushError> {
        let sessions = self.sessions.sessions_with_active_device(user_id).await?;
        let badge = self.badge(user_id, CLEAR_BADGE_FALLBACK).await;
        debug!(user_id = %user_id, channel_id = %channel_id, badge, "clearing push notifications");

        let msg = PushMessage {
            id: id.to_string(),
            push_type: PUSH_TYPE_CLEAR.to_string(),
            channel_id: channel_id.to_string(),
            content_available: 0,
            badge,
            ..PushMessage::default()
        };

        let mut report = DeliveryReport::default();
        for session in &sessions {
            let mut device_msg = msg.clone();
            let (platform, token) = session.device_platform();
            device_msg.set_device(platform, token);
            self.deliver(device_msg, session, &mut report).await;
        }
        Ok(report)
    }

    /// Forward a device acknowledgement. Errors are logged and dropped.
    pub async fn ack(&self, ack: &PushAck) {
        if let Err(e) = self.relay.ack(ack).await {
            debug!(ack_id = %ack.id, error = %e, "push ack failed");
        }
    }

    async fn deliver(&self, msg: PushMessage, session: &Session, report: &mut DeliveryReport) {
        report.attempted += 1;
        match self.send_to_relay(msg, session).await {
            Ok(SendOutcome::Sent) => report.sent += 1,
            Ok(SendOutcome::Suppressed) => report.attempted -= 1,
            Ok(SendOutcome::DeviceRemoved) => {
                report.removed += 1;
                report.failed += 1;
            }
            Ok(SendOutcome::Failed(_)) => report.failed += 1,
            Err(e) => {
                error!(
                    user_id = %session.user_id,
                    session_id = %session.id,
                    error = %e,
                    "error sending push notification"
                );
                report.failed += 1;
            }
        }
    }

    /// Post one payload and act on the relay verdict. Never retried.
    pub async fn send_to_relay(
        &self,
        mut msg: PushMessage,
        session: &Session,
    ) -> Result<SendOutcome, PushError> {
        msg.server_id.clone_from(&self.settings.server_id);

        let Some(msg) = self.observer.will_be_sent(msg) else {
            debug!(session_id = %session.id, "push notification suppressed by observer");
            return Ok(SendOutcome::Suppressed);
        };

        let response = match self.relay.send_push(&msg).await {
            Ok(response) => response,
            Err(e) => {
                counter!("push_failed_total", "reason" => e.reason()).increment(1);
                self.observer.has_failed(&msg, &e.to_string());
                return Err(e.into());
            }
        };

        match response.classify() {
            RelayStatus::Remove => {
                info!(
                    user_id = %session.user_id,
                    session_id = %session.id,
                    "device reported as removed, detaching it from the session"
                );
                if let Err(e) = self
                    .sessions
                    .attach_device_id(&session.id, "", session.expires_at)
                    .await
                {
                    error!(session_id = %session.id, error = %e, "failed to detach device id");
                }
                self.sessions
                    .clear_session_cache_for_user(&session.user_id)
                    .await;
                counter!("push_device_removed_total").increment(1);
                counter!("push_failed_total", "reason" => "removed").increment(1);
                self.observer.has_failed(&msg, "device was reported as removed");
                Ok(SendOutcome::DeviceRemoved)
            }
            RelayStatus::Fail => {
                let reason = response.error.unwrap_or_default();
                error!(
                    notification_id = %msg.id,
                    ack_id = %msg.ack_id,
                    device_id = %msg.device_id,
                    error = %reason,
                    "device push reported as error"
                );
                counter!("push_failed_total", "reason" => "relay_fail").increment(1);
                self.observer.has_failed(&msg, &reason);
                Ok(SendOutcome::Failed(reason))
            }
            RelayStatus::Ok | RelayStatus::Other => {
                counter!("push_sent_total").increment(1);
                self.observer.has_been_sent(&msg);
                debug!(notification_id = %msg.id, ack_id = %msg.ack_id, "push notification has been sent");
                Ok(SendOutcome::Sent)
            }
        }
    }

    async fn badge(&self, user_id: &UserId, fallback: u64) -> u64 {
        match self.unread.unread_count(user_id).await {
            Ok(count) => count,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "could not get the unread count for the user");
                fallback
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
