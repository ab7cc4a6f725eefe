//! Stable error codes carried in [`Frame::Error`](crate::Frame::Error).
//!
//! Codes never change meaning once released. The message sent next to a code
//! is for people; clients branch on the code.

use rapport_core::{BusError, CoreError, StoreError};

use crate::codec::ProtocolError;

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // Protocol
    InvalidFrame = 1001,
    UnsupportedVersion = 1002,
    HandshakeRequired = 1003,
    FrameTooLarge = 1004,
    UnexpectedFrame = 1005,

    // Matching and conversations
    InvalidInput = 2001,
    NoSuchMatch = 2002,
    InvalidSender = 2003,
    NotParticipant = 2004,
    NoPendingLike = 2005,
    StorageUnavailable = 2100,

    // Subscriptions
    NotSubscribed = 3001,
    AlreadySubscribed = 3002,
    TooManySubscriptions = 3003,
    ScopeForbidden = 3004,
}

impl ErrorCode {
    /// Numeric wire value.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the client may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::StorageUnavailable)
    }

    /// Actionable text for the person using the client.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCode::InvalidFrame | ErrorCode::UnexpectedFrame => {
                "Something went wrong, please update the app"
            }
            ErrorCode::UnsupportedVersion => "This version of the app is no longer supported",
            ErrorCode::HandshakeRequired => "Not connected yet, please reconnect",
            ErrorCode::FrameTooLarge => "That is too large to send",
            ErrorCode::InvalidInput => "That request is not valid",
            ErrorCode::NoSuchMatch => "This conversation no longer exists",
            ErrorCode::InvalidSender | ErrorCode::NotParticipant => {
                "You are not part of this conversation"
            }
            ErrorCode::NoPendingLike => "That request is no longer pending",
            ErrorCode::StorageUnavailable => "Could not send request, try again",
            ErrorCode::NotSubscribed
            | ErrorCode::AlreadySubscribed
            | ErrorCode::TooManySubscriptions => "Live updates are unavailable, please reconnect",
            ErrorCode::ScopeForbidden => "You cannot follow that",
        }
    }
}

impl From<&CoreError> for ErrorCode {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::InvalidInput(_) => ErrorCode::InvalidInput,
            CoreError::NoSuchMatch(_) => ErrorCode::NoSuchMatch,
            CoreError::InvalidSender { .. } => ErrorCode::InvalidSender,
            CoreError::NotParticipant { .. } => ErrorCode::NotParticipant,
            CoreError::NoPendingLike { .. } => ErrorCode::NoPendingLike,
            CoreError::Storage(StoreError::Conflict { .. }) => ErrorCode::InvalidInput,
            CoreError::Storage(_) => ErrorCode::StorageUnavailable,
        }
    }
}

impl From<&BusError> for ErrorCode {
    fn from(err: &BusError) -> Self {
        match err {
            BusError::NotSubscribed(_) => ErrorCode::NotSubscribed,
            BusError::AlreadySubscribed(_) => ErrorCode::AlreadySubscribed,
            BusError::MaxSubscriptionsReached => ErrorCode::TooManySubscriptions,
        }
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::FrameTooLarge(_) => ErrorCode::FrameTooLarge,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::Incomplete(_)
            | ProtocolError::TrailingData(_)
            | ProtocolError::Encode(_)
            | ProtocolError::Decode(_) => ErrorCode::InvalidFrame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::{MatchId, Scope};

    #[test]
    fn test_core_error_codes() {
        let code = ErrorCode::from(&CoreError::NoSuchMatch(MatchId::generate()));
        assert_eq!(code.code(), 2002);
        assert!(!code.is_retryable());

        let code = ErrorCode::from(&CoreError::Storage(StoreError::Unavailable("down".into())));
        assert_eq!(code, ErrorCode::StorageUnavailable);
        assert!(code.is_retryable());
        assert_eq!(code.user_message(), "Could not send request, try again");
    }

    #[test]
    fn test_bus_and_protocol_codes() {
        let bus = BusError::AlreadySubscribed(Scope::Matches("alice".into()));
        assert_eq!(ErrorCode::from(&bus).code(), 3002);

        let proto = ProtocolError::FrameTooLarge(usize::MAX);
        assert_eq!(ErrorCode::from(&proto), ErrorCode::FrameTooLarge);
    }
}
