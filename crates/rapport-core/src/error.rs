//! Errors surfaced by the core services.

use crate::model::{MatchId, UserId};
use crate::store::StoreError;
use thiserror::Error;

/// Core service errors.
///
/// Caller errors (`InvalidInput`, `NoSuchMatch`, `InvalidSender`,
/// `NotParticipant`, `NoPendingLike`) are not worth retrying. `Storage` errors
/// are; every write except a keyless message append is idempotent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed request (self-like, empty body, oversized body).
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    /// The referenced match does not exist.
    #[error("No such match: {0}")]
    NoSuchMatch(MatchId),

    /// The sender is not one of the match's two participants.
    #[error("User {sender} cannot send to match {match_id}")]
    InvalidSender {
        /// Rejected sender.
        sender: UserId,
        /// Target match.
        match_id: MatchId,
    },

    /// The user is not one of the match's two participants.
    #[error("User {user} is not part of match {match_id}")]
    NotParticipant {
        /// Rejected user.
        user: UserId,
        /// Target match.
        match_id: MatchId,
    },

    /// There is no pending like from `from` to `to`.
    #[error("No pending like from {from} to {to}")]
    NoPendingLike {
        /// Would-be liker.
        from: UserId,
        /// Would-be recipient.
        to: UserId,
    },

    /// Storage failure; safe to retry with the same inputs.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CoreError {
    /// Whether the caller may retry the same request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(e) if !e.is_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!CoreError::InvalidInput("empty body").is_retryable());
        assert!(!CoreError::NoSuchMatch(MatchId::generate()).is_retryable());
        assert!(CoreError::Storage(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!CoreError::Storage(StoreError::Conflict {
            constraint: "likes".into()
        })
        .is_retryable());
    }
}
