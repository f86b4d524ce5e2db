//! Server-to-client events and their broadcast targets.
//!
//! An [`Event`] is immutable once handed to the hub. The hub wraps it in a
//! [`PreparedEvent`], which serializes the event name, payload, and broadcast
//! descriptor exactly once; each connection then splices in its own sequence
//! number when writing.
//!
//! Wire format (one text frame per event):
//!
//! ```json
//! {"event":"posted","data":{...},"broadcast":{"omit_users":null,"user_id":"","channel_id":"c1","team_id":""},"seq":7}
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::ids::{ChannelId, TeamId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// EventKind
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! event_kinds {
    ($($(#[$meta:meta])* $variant:ident => $wire:literal,)+) => {
        /// Discriminant of an [`Event`].
        ///
        /// Known kinds map to their wire names; anything else round-trips
        /// through [`EventKind::Custom`] so plugins can introduce new events.
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub enum EventKind {
            $($(#[$meta])* $variant,)+
            /// An event name the server does not know about.
            Custom(String),
        }

        impl EventKind {
            /// Wire name of the event.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Custom(name) => name,
                }
            }
        }

        impl From<&str> for EventKind {
            fn from(name: &str) -> Self {
                match name {
                    $($wire => Self::$variant,)+
                    other => Self::Custom(other.to_owned()),
                }
            }
        }
    };
}

event_kinds! {
    /// A user is typing in a channel.
    Typing => "typing",
    /// A new post was created.
    Posted => "posted",
    /// A post was edited.
    PostEdited => "post_edited",
    /// A post was deleted.
    PostDeleted => "post_deleted",
    /// A post was marked unread.
    PostUnread => "post_unread",
    /// A channel was created.
    ChannelCreated => "channel_created",
    /// A channel was deleted.
    ChannelDeleted => "channel_deleted",
    /// A channel was updated.
    ChannelUpdated => "channel_updated",
    /// A channel was viewed by the user.
    ChannelViewed => "channel_viewed",
    /// A channel membership changed.
    ChannelMemberUpdated => "channel_member_updated",
    /// A direct channel was opened.
    DirectAdded => "direct_added",
    /// A group channel was opened.
    GroupAdded => "group_added",
    /// A new user account was created.
    NewUser => "new_user",
    /// The user was added to a team.
    AddedToTeam => "added_to_team",
    /// The user left a team.
    LeaveTeam => "leave_team",
    /// A team was updated.
    UpdateTeam => "update_team",
    /// A user was added to a channel.
    UserAdded => "user_added",
    /// A user profile was updated.
    UserUpdated => "user_updated",
    /// A user's roles changed.
    UserRoleUpdated => "user_role_updated",
    /// A user was removed from a channel.
    UserRemoved => "user_removed",
    /// A single preference changed.
    PreferenceChanged => "preference_changed",
    /// Several preferences changed.
    PreferencesChanged => "preferences_changed",
    /// Preferences were deleted.
    PreferencesDeleted => "preferences_deleted",
    /// A client-only ephemeral post.
    EphemeralMessage => "ephemeral_message",
    /// A user's presence status changed.
    StatusChange => "status_change",
    /// First event on every authenticated connection.
    Hello => "hello",
    /// A reaction was added.
    ReactionAdded => "reaction_added",
    /// A reaction was removed.
    ReactionRemoved => "reaction_removed",
    /// A custom emoji was added.
    EmojiAdded => "emoji_added",
    /// A role definition changed.
    RoleUpdated => "role_updated",
    /// The server license changed.
    LicenseChanged => "license_changed",
    /// The client-visible configuration changed.
    ConfigChanged => "config_changed",
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventData
// ─────────────────────────────────────────────────────────────────────────────

/// Key/value payload of an event.
///
/// Arbitrary keys are allowed (clients depend on extra fields), but reads go
/// through typed accessors instead of raw `Value` matching.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(Map<String, Value>);

impl EventData {
    /// Empty payload.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Set `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let _ = self.0.insert(key.into(), value.into());
    }

    /// Raw value at `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value at `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// String value at a nested path such as `["user", "id"]`.
    pub fn get_path_str(&self, path: &[&str]) -> Option<&str> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.get(*key)?;
        }
        current.as_str()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast
// ─────────────────────────────────────────────────────────────────────────────

/// Who an event is for.
///
/// At most one of `user_id` / `channel_id` / `team_id` is normally set; the
/// visibility filter checks them in that order. The two sensitivity flags
/// are server-side only and never serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Users that must not receive the event.
    pub omit_users: HashSet<UserId>,
    /// Deliver only to this user.
    pub user_id: Option<UserId>,
    /// Deliver only to members of this channel.
    pub channel_id: Option<ChannelId>,
    /// Deliver only to members of this team.
    pub team_id: Option<TeamId>,
    /// The payload was sanitized; privileged sessions get a separate full event.
    pub contains_sanitized_data: bool,
    /// The payload is privileged; only privileged sessions may see it.
    pub contains_sensitive_data: bool,
}

/// Serialized shape of [`Broadcast`]: unset targets are empty strings and an
/// empty omit-set is `null`.
#[derive(Serialize, Deserialize)]
struct WireBroadcast {
    #[serde(default)]
    omit_users: Option<HashMap<String, bool>>,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    team_id: String,
}

fn non_empty<T: From<String>>(value: String) -> Option<T> {
    (!value.is_empty()).then(|| T::from(value))
}

impl From<&Broadcast> for WireBroadcast {
    fn from(b: &Broadcast) -> Self {
        Self {
            omit_users: (!b.omit_users.is_empty()).then(|| {
                b.omit_users
                    .iter()
                    .map(|u| (u.to_string(), true))
                    .collect()
            }),
            user_id: b.user_id.as_ref().map(ToString::to_string).unwrap_or_default(),
            channel_id: b
                .channel_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            team_id: b.team_id.as_ref().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

impl From<WireBroadcast> for Broadcast {
    fn from(w: WireBroadcast) -> Self {
        Self {
            omit_users: w
                .omit_users
                .unwrap_or_default()
                .into_iter()
                .filter(|(_, omitted)| *omitted)
                .map(|(u, _)| UserId::from(u))
                .collect(),
            user_id: non_empty(w.user_id),
            channel_id: non_empty(w.channel_id),
            team_id: non_empty(w.team_id),
            contains_sanitized_data: false,
            contains_sensitive_data: false,
        }
    }
}

impl Serialize for Broadcast {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireBroadcast::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Broadcast {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        WireBroadcast::deserialize(deserializer).map(Self::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// An outbound real-time event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    kind: EventKind,
    data: EventData,
    broadcast: Broadcast,
}

impl Event {
    /// Create an event with the given target. Empty IDs mean "unset".
    pub fn new(
        kind: EventKind,
        team_id: Option<TeamId>,
        channel_id: Option<ChannelId>,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            kind,
            data: EventData::new(),
            broadcast: Broadcast {
                team_id: team_id.filter(|t| !t.is_empty()),
                channel_id: channel_id.filter(|c| !c.is_empty()),
                user_id: user_id.filter(|u| !u.is_empty()),
                ..Broadcast::default()
            },
        }
    }

    /// Event for every connection that passes the remaining filter rules.
    pub fn to_all(kind: EventKind) -> Self {
        Self::new(kind, None, None, None)
    }

    /// Event for one user's connections.
    pub fn to_user(kind: EventKind, user_id: UserId) -> Self {
        Self::new(kind, None, None, Some(user_id))
    }

    /// Event for members of a channel.
    pub fn to_channel(kind: EventKind, channel_id: ChannelId) -> Self {
        Self::new(kind, None, Some(channel_id), None)
    }

    /// Event for members of a team.
    pub fn to_team(kind: EventKind, team_id: TeamId) -> Self {
        Self::new(kind, Some(team_id), None, None)
    }

    /// Exclude these users from delivery.
    #[must_use]
    pub fn omit_users(mut self, users: impl IntoIterator<Item = UserId>) -> Self {
        self.broadcast.omit_users.extend(users);
        self
    }

    /// Mark the payload as sanitized.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.broadcast.contains_sanitized_data = true;
        self
    }

    /// Mark the payload as sensitive.
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.broadcast.contains_sensitive_data = true;
        self
    }

    /// Add a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key, value);
        self
    }

    /// Add a payload field in place.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key, value);
    }

    /// Event discriminant.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Payload.
    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Target descriptor.
    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }

    /// Serialize with a sequence number.
    pub fn to_json(&self, seq: u64) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireEventRef {
            event: &self.kind,
            data: &self.data,
            broadcast: &self.broadcast,
            seq,
        })
    }

    /// Parse a serialized event, returning it with its sequence number.
    pub fn from_json(json: &str) -> Result<(Self, u64), serde_json::Error> {
        let wire: WireEvent = serde_json::from_str(json)?;
        Ok((
            Self {
                kind: wire.event,
                data: wire.data,
                broadcast: wire.broadcast,
            },
            wire.seq,
        ))
    }
}

#[derive(Serialize)]
struct WireEventRef<'a> {
    event: &'a EventKind,
    data: &'a EventData,
    broadcast: &'a Broadcast,
    seq: u64,
}

#[derive(Deserialize)]
struct WireEvent {
    event: EventKind,
    #[serde(default)]
    data: EventData,
    #[serde(default)]
    broadcast: Broadcast,
    #[serde(default)]
    seq: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// PreparedEvent
// ─────────────────────────────────────────────────────────────────────────────

/// An event whose sequence-independent parts are already serialized.
///
/// Shared (`Arc`) across every recipient of one broadcast.
#[derive(Debug)]
pub struct PreparedEvent {
    event: Event,
    event_json: String,
    data_json: String,
    broadcast_json: String,
}

impl PreparedEvent {
    /// Serialize `event` once for fan-out.
    pub fn new(event: Event) -> Result<Arc<Self>, serde_json::Error> {
        let event_json = serde_json::to_string(&event.kind)?;
        let data_json = serde_json::to_string(&event.data)?;
        let broadcast_json = serde_json::to_string(&event.broadcast)?;
        Ok(Arc::new(Self {
            event,
            event_json,
            data_json,
            broadcast_json,
        }))
    }

    /// The source event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Event discriminant.
    pub fn kind(&self) -> &EventKind {
        &self.event.kind
    }

    /// Render the final frame text with `seq` spliced in.
    pub fn encode(&self, seq: u64) -> String {
        format!(
            r#"{{"event":{},"data":{},"broadcast":{},"seq":{seq}}}"#,
            self.event_json, self.data_json, self.broadcast_json
        )
    }
}
