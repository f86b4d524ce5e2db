//! Error types for collaborator calls.

use thiserror::Error;

/// Failure reported by an external store (sessions, memberships, unread
/// counts, authorization).
///
/// Callers on the event and push paths never propagate these: visibility
/// checks treat them as "deny" and badge computation falls back to a default.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist (e.g. unknown session token).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record looked up.
        entity: &'static str,
        /// The key that missed.
        id: String,
    },
    /// The store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Any other store-side failure.
    #[error("store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the failure is a client-side miss (as opposed to a server fault).
    ///
    /// Misses are logged at `debug`, faults at `error`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = StoreError::NotFound {
            entity: "session",
            id: "tok".into(),
        };
        assert_eq!(err.to_string(), "session not found: tok");
        assert!(err.is_not_found());
    }

    #[test]
    fn unavailable_is_not_a_miss() {
        let err = StoreError::Unavailable("connection refused".into());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("connection refused"));
    }
}
