//! Events fanned out by the realtime bus.
//!
//! Every committed write and every ephemeral signal becomes one [`Event`].
//! Events are routed to [`Scope`]s; a subscriber listens to scopes, never to
//! individual writers.

use crate::model::{Like, Match, MatchId, Message, ReadWatermark, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A change pushed to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A like was stored.
    LikeCreated { like: Like },
    /// A match row was inserted.
    MatchCreated { matched: Match },
    /// A message was appended to a conversation.
    MessageAppended { message: Message },
    /// A read watermark moved forward.
    ReadUpdated { watermark: ReadWatermark },
    /// A user came online or went offline.
    PresenceChanged { user_id: UserId, online: bool },
    /// A user is typing in a conversation. There is no "stopped" counterpart.
    TypingPinged { match_id: MatchId, from: UserId },
}

/// Entity type of an event. Each kind has its own publish queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Interest,
    Match,
    Message,
    Read,
    Presence,
    Typing,
}

impl EventKind {
    /// All kinds, in queue order.
    pub const ALL: [EventKind; 6] = [
        EventKind::Interest,
        EventKind::Match,
        EventKind::Message,
        EventKind::Read,
        EventKind::Presence,
        EventKind::Typing,
    ];

    /// Whether losing an event of this kind requires the client to resync.
    #[must_use]
    pub fn is_durable(self) -> bool {
        !matches!(self, EventKind::Presence | EventKind::Typing)
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Interest => "interest",
            EventKind::Match => "match",
            EventKind::Message => "message",
            EventKind::Read => "read",
            EventKind::Presence => "presence",
            EventKind::Typing => "typing",
        }
    }
}

impl Event {
    /// The entity type of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::LikeCreated { .. } => EventKind::Interest,
            Event::MatchCreated { .. } => EventKind::Match,
            Event::MessageAppended { .. } => EventKind::Message,
            Event::ReadUpdated { .. } => EventKind::Read,
            Event::PresenceChanged { .. } => EventKind::Presence,
            Event::TypingPinged { .. } => EventKind::Typing,
        }
    }

    /// Every scope this event must be delivered to.
    #[must_use]
    pub fn scopes(&self) -> Vec<Scope> {
        match self {
            Event::LikeCreated { like } => vec![
                Scope::Likes(like.liked.clone()),
                Scope::Likes(like.liker.clone()),
            ],
            Event::MatchCreated { matched } => vec![
                Scope::Matches(matched.user_a.clone()),
                Scope::Matches(matched.user_b.clone()),
            ],
            Event::MessageAppended { message } => vec![Scope::Conversation(message.match_id)],
            Event::ReadUpdated { watermark } => vec![
                Scope::ReadState(watermark.user_id.clone()),
                Scope::Conversation(watermark.match_id),
            ],
            Event::PresenceChanged { user_id, .. } => vec![Scope::Presence(user_id.clone())],
            Event::TypingPinged { match_id, .. } => vec![Scope::Typing(*match_id)],
        }
    }
}

/// A subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Scope {
    /// Likes sent or received by a user.
    Likes(UserId),
    /// Matches touching a user.
    Matches(UserId),
    /// Messages and read receipts of one conversation.
    Conversation(MatchId),
    /// Read watermarks of a user across conversations.
    ReadState(UserId),
    /// Online state of a user.
    Presence(UserId),
    /// Typing pings in one conversation.
    Typing(MatchId),
}

impl Scope {
    /// Whether events on this scope survive loss only through resync.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        !matches!(self, Scope::Presence(_) | Scope::Typing(_))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Likes(user) => write!(f, "likes:{user}"),
            Scope::Matches(user) => write!(f, "matches:{user}"),
            Scope::Conversation(id) => write!(f, "conversation:{id}"),
            Scope::ReadState(user) => write!(f, "read:{user}"),
            Scope::Presence(user) => write!(f, "presence:{user}"),
            Scope::Typing(id) => write!(f, "typing:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now;

    #[test]
    fn test_match_created_reaches_both_users() {
        let matched = Match {
            id: MatchId::generate(),
            user_a: "alice".into(),
            user_b: "bob".into(),
            created_at: now(),
        };
        let event = Event::MatchCreated { matched };

        assert_eq!(event.kind(), EventKind::Match);
        assert_eq!(
            event.scopes(),
            vec![Scope::Matches("alice".into()), Scope::Matches("bob".into())]
        );
    }

    #[test]
    fn test_ephemeral_kinds() {
        let typing = Event::TypingPinged {
            match_id: MatchId::generate(),
            from: "alice".into(),
        };
        assert!(!typing.kind().is_durable());
        assert!(!typing.scopes()[0].is_durable());
        assert!(EventKind::Message.is_durable());
        assert!(Scope::Conversation(MatchId::generate()).is_durable());
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::Matches("bob".into()).to_string(), "matches:bob");
        assert_eq!(Scope::Presence("bob".into()).to_string(), "presence:bob");
    }
}
