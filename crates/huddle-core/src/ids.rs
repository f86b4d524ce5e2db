//! Branded ID newtypes.
//!
//! Users, channels, teams, sessions, posts, and live connections each get a
//! distinct wrapper around `String` so a channel ID can never be passed where
//! a user ID is expected. Freshly minted IDs are UUID v7 in simple (dashless)
//! form; IDs received from collaborators are kept verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new dashless UUID v7 string.
pub fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(new_id())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the ID is the empty string.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a user account.
    UserId
}

branded_id! {
    /// Identifier of a channel.
    ChannelId
}

branded_id! {
    /// Identifier of a team.
    TeamId
}

branded_id! {
    /// Identifier of an authenticated session.
    SessionId
}

branded_id! {
    /// Identifier of a post.
    PostId
}

branded_id! {
    /// Identifier of one live socket connection.
    ConnectionId
}
