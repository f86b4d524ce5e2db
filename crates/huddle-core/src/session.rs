//! Authenticated session as resolved from the session store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TeamId, UserId};

/// Session prop marking a guest account.
pub const PROP_IS_GUEST: &str = "is_guest";

/// Role granting system administration (and with it, private data access).
pub const ROLE_SYSTEM_ADMIN: &str = "system_admin";

/// Role of an ordinary user.
pub const ROLE_SYSTEM_USER: &str = "system_user";

/// Role of a guest account.
pub const ROLE_SYSTEM_GUEST: &str = "system_guest";

/// A team the session's user belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    /// The team.
    pub team_id: TeamId,
    /// Space-separated team roles.
    #[serde(default)]
    pub roles: String,
}

/// An authenticated session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Bearer token.
    pub token: String,
    /// Owning user.
    pub user_id: UserId,
    /// Expiry in Unix milliseconds; `0` means never.
    pub expires_at: i64,
    /// Space-separated system roles.
    #[serde(default)]
    pub roles: String,
    /// Mobile device id as `platform:token`, empty when none is attached.
    #[serde(default)]
    pub device_id: String,
    /// Free-form session properties.
    #[serde(default)]
    pub props: HashMap<String, String>,
    /// Team memberships captured when the session was loaded.
    #[serde(default)]
    pub team_members: Vec<TeamMembership>,
}

impl Session {
    /// Build a minimal session for `user_id` with `token`.
    pub fn new(user_id: UserId, token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            id: SessionId::new(),
            token: token.into(),
            user_id,
            expires_at,
            roles: ROLE_SYSTEM_USER.to_owned(),
            device_id: String::new(),
            props: HashMap::new(),
            team_members: Vec::new(),
        }
    }

    /// Whether the session has expired at `now_millis`.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now_millis
    }

    /// Whether the session has expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(crate::now_millis())
    }

    /// System roles as a list.
    pub fn user_roles(&self) -> Vec<&str> {
        self.roles.split_whitespace().collect()
    }

    /// Whether the session carries `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.split_whitespace().any(|r| r == role)
    }

    /// Whether the session belongs to a guest account.
    pub fn is_guest(&self) -> bool {
        self.props.get(PROP_IS_GUEST).is_some_and(|v| v == "true")
    }

    /// Membership record for `team_id`, if any.
    pub fn team(&self, team_id: &TeamId) -> Option<&TeamMembership> {
        self.team_members.iter().find(|m| &m.team_id == team_id)
    }

    /// Whether a mobile device is attached.
    pub fn has_device(&self) -> bool {
        !self.device_id.is_empty()
    }

    /// Split the device id into `(platform, device_token)`.
    ///
    /// Ids without a `:` separator have an empty platform.
    pub fn device_platform(&self) -> (&str, &str) {
        match self.device_id.split_once(':') {
            Some((platform, token)) => (platform, token),
            None => ("", self.device_id.as_str()),
        }
    }

    /// Builder: set roles.
    #[must_use]
    pub fn with_roles(mut self, roles: impl Into<String>) -> Self {
        self.roles = roles.into();
        self
    }

    /// Builder: attach a device id.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Builder: add a team membership.
    #[must_use]
    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_members.push(TeamMembership {
            team_id,
            roles: "team_user".to_owned(),
        });
        self
    }

    /// Builder: mark as guest.
    #[must_use]
    pub fn as_guest(mut self) -> Self {
        let _ = self.props.insert(PROP_IS_GUEST.to_owned(), "true".to_owned());
        self.roles = ROLE_SYSTEM_GUEST.to_owned();
        self
    }
}
