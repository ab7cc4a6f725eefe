//! # rapport-core
//!
//! Mutual-interest matching and realtime conversations.
//!
//! This crate provides the building blocks:
//!
//! - **MatchResolver** - Likes, pending requests and exactly-once matches
//! - **ConversationLog** - Ordered, append-only message history per match
//! - **ReadTracker** - Read watermarks and derived unread counts
//! - **PresenceHub** - Ephemeral online state, never persisted
//! - **TypingSignal** - Throttled typing pings, expired by the receiver
//! - **RealtimeBus** - Fan-out of every write to subscribed scopes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌─────────────┐
//! │ MatchResolver│   │ ConversationLog │   │ ReadTracker │
//! └──────┬───────┘   └────────┬────────┘   └──────┬──────┘
//!        │                    │                   │
//!        ▼                    ▼                   ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                        Store                         │
//! └──────────────────────────────────────────────────────┘
//!        │ events             │ pump              │ events
//!        ▼                    ▼                   ▼
//! ┌──────────────────────────────────────────────────────┐
//! │          RealtimeBus (queue per event kind)          │◀── PresenceHub, TypingSignal
//! └──────────────────────────┬───────────────────────────┘
//!                            ▼
//!                     scope subscribers
//! ```

pub mod bus;
pub mod conversation;
pub mod error;
pub mod event;
pub mod matching;
pub mod model;
pub mod presence;
pub mod read;
pub mod store;
pub mod typing;

pub use bus::{
    BusConfig, BusError, BusStats, ConnectionId, Delivery, Publisher, RealtimeBus,
    SubscriptionHandle,
};
pub use conversation::{ConversationConfig, ConversationLog};
pub use error::CoreError;
pub use event::{Event, EventKind, Scope};
pub use matching::{LikeOutcome, MatchResolution, MatchResolver};
pub use model::{Like, Match, MatchId, Message, MessageId, ReadWatermark, UserId, UserPair};
pub use presence::{PresenceConfig, PresenceHub};
pub use read::{ConversationPreview, ReadOutcome, ReadTracker};
pub use store::{SqliteStore, Store, StoreError};
pub use typing::{TypingConfig, TypingIndicator, TypingSignal, TYPING_EXPIRY};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::event::Event;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    /// Collect events until the receiver stays quiet for a moment.
    pub(crate) async fn drain(rx: &mut broadcast::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Ok(Ok(event)) = timeout(Duration::from_millis(150), rx.recv()).await {
            events.push(event);
        }
        events
    }
}
