//! Frame types for the Rapport protocol.
//!
//! Frames are the unit of communication between clients and the server.
//! Requests carry an `id` that the matching response echoes.

use chrono::{DateTime, Utc};
use rapport_core::{Event, Like, Match, MatchId, Message, Scope, UserId};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Like = 0x04,
    Accept = 0x05,
    Reject = 0x06,
    Withdraw = 0x07,
    Send = 0x08,
    History = 0x09,
    MarkRead = 0x0A,
    Typing = 0x0B,
    Sync = 0x0C,
    Ping = 0x0D,
    Connected = 0x81,
    Ack = 0x82,
    Error = 0x83,
    LikeResult = 0x84,
    Sent = 0x85,
    HistoryPage = 0x86,
    SyncState = 0x87,
    Event = 0x88,
    Resync = 0x89,
    Pong = 0x8A,
}

impl FrameType {
    /// Whether clients may send frames of this type.
    #[must_use]
    pub fn is_client(self) -> bool {
        (self as u8) < 0x80
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Subscribe),
            0x03 => Ok(FrameType::Unsubscribe),
            0x04 => Ok(FrameType::Like),
            0x05 => Ok(FrameType::Accept),
            0x06 => Ok(FrameType::Reject),
            0x07 => Ok(FrameType::Withdraw),
            0x08 => Ok(FrameType::Send),
            0x09 => Ok(FrameType::History),
            0x0A => Ok(FrameType::MarkRead),
            0x0B => Ok(FrameType::Typing),
            0x0C => Ok(FrameType::Sync),
            0x0D => Ok(FrameType::Ping),
            0x81 => Ok(FrameType::Connected),
            0x82 => Ok(FrameType::Ack),
            0x83 => Ok(FrameType::Error),
            0x84 => Ok(FrameType::LikeResult),
            0x85 => Ok(FrameType::Sent),
            0x86 => Ok(FrameType::HistoryPage),
            0x87 => Ok(FrameType::SyncState),
            0x88 => Ok(FrameType::Event),
            0x89 => Ok(FrameType::Resync),
            0x8A => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// One conversation row in a [`Frame::SyncState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub matched: Match,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    pub unread: u64,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // Client -> server
    /// Handshake; must be the first frame of a connection.
    Connect {
        version: Version,
        /// Identity asserted by the authenticating proxy.
        user_id: UserId,
    },

    /// Subscribe to a scope.
    Subscribe { id: u64, scope: Scope },

    /// Unsubscribe from a scope.
    Unsubscribe { id: u64, scope: Scope },

    /// Like another user.
    Like { id: u64, target: UserId },

    /// Accept the pending like from `from`.
    Accept { id: u64, from: UserId },

    /// Reject the pending like from `from`.
    Reject { id: u64, from: UserId },

    /// Withdraw a pending like sent to `target`.
    Withdraw { id: u64, target: UserId },

    /// Append a message to a conversation.
    Send {
        id: u64,
        match_id: MatchId,
        body: String,
        /// Client-generated idempotency key for safe retries.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_key: Option<String>,
    },

    /// Request history after `since`.
    History {
        id: u64,
        match_id: MatchId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<DateTime<Utc>>,
        limit: u32,
    },

    /// Mark a conversation read up to `at`, or up to now.
    MarkRead {
        id: u64,
        match_id: MatchId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
    },

    /// Typing ping. Fire-and-forget, never answered.
    Typing { match_id: MatchId },

    /// Request the wholesale state re-fetched after a reconnect.
    Sync { id: u64 },

    /// Keepalive ping; also refreshes presence.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    // Server -> client
    /// Handshake accepted.
    Connected {
        connection_id: String,
        version: Version,
        /// Heartbeat interval the client should keep, in milliseconds.
        heartbeat: u32,
    },

    /// Request succeeded with nothing to return.
    Ack { id: u64 },

    /// Request failed.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        /// Actionable, user-facing message.
        message: String,
    },

    /// Result of `Like` or `Accept`.
    LikeResult {
        id: u64,
        /// Set once the pair is matched; absent while the like is pending.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matched: Option<Match>,
        /// Whether this request created the match.
        created: bool,
    },

    /// A message was stored.
    Sent { id: u64, message: Message },

    /// One page of history.
    HistoryPage {
        id: u64,
        match_id: MatchId,
        messages: Vec<Message>,
        /// More messages follow after the last one returned.
        more: bool,
    },

    /// Wholesale state after (re)connect.
    SyncState {
        id: u64,
        matches: Vec<Match>,
        incoming: Vec<Like>,
        outgoing: Vec<Like>,
        inbox: Vec<InboxEntry>,
        /// Match counterparts currently online.
        online: Vec<UserId>,
    },

    /// A pushed event from a subscribed scope.
    Event { event: Event },

    /// Events on `scope` were dropped; re-fetch before trusting local state.
    Resync { scope: Scope, missed: u64 },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Like { .. } => FrameType::Like,
            Frame::Accept { .. } => FrameType::Accept,
            Frame::Reject { .. } => FrameType::Reject,
            Frame::Withdraw { .. } => FrameType::Withdraw,
            Frame::Send { .. } => FrameType::Send,
            Frame::History { .. } => FrameType::History,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Sync { .. } => FrameType::Sync,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::LikeResult { .. } => FrameType::LikeResult,
            Frame::Sent { .. } => FrameType::Sent,
            Frame::HistoryPage { .. } => FrameType::HistoryPage,
            Frame::SyncState { .. } => FrameType::SyncState,
            Frame::Event { .. } => FrameType::Event,
            Frame::Resync { .. } => FrameType::Resync,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// The request id carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::Like { id, .. }
            | Frame::Accept { id, .. }
            | Frame::Reject { id, .. }
            | Frame::Withdraw { id, .. }
            | Frame::Send { id, .. }
            | Frame::History { id, .. }
            | Frame::MarkRead { id, .. }
            | Frame::Sync { id }
            | Frame::Ack { id }
            | Frame::Error { id, .. }
            | Frame::LikeResult { id, .. }
            | Frame::Sent { id, .. }
            | Frame::HistoryPage { id, .. }
            | Frame::SyncState { id, .. } => Some(*id),
            Frame::Connect { .. }
            | Frame::Typing { .. }
            | Frame::Ping { .. }
            | Frame::Connected { .. }
            | Frame::Event { .. }
            | Frame::Resync { .. }
            | Frame::Pong { .. } => None,
        }
    }

    /// Create a new Connect frame for the current protocol version.
    #[must_use]
    pub fn connect(user_id: impl Into<UserId>) -> Self {
        Frame::Connect {
            version: Version::default(),
            user_id: user_id.into(),
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: Version::default(),
            heartbeat,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, scope: Scope) -> Self {
        Frame::Subscribe { id, scope }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(id: u64, match_id: MatchId, body: impl Into<String>) -> Self {
        Frame::Send {
            id,
            match_id,
            body: body.into(),
            client_key: None,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(event: Event) -> Self {
        Frame::Event { event }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
