//! Durable storage for likes, matches, messages and read watermarks.
//!
//! Each table has its own trait so services only name what they touch. The
//! uniqueness constraints live in the backend; a violated constraint comes back
//! as [`StoreError::Conflict`] and callers decide whether that means success.

mod migrations;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::model::{Like, Match, MatchId, Message, MessageId, ReadWatermark, UserId, UserPair};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Uniqueness conflict: {constraint}")]
    Conflict {
        /// Backend description of the violated constraint.
        constraint: String,
    },

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The backend could not be reached (poisoned handle, closed pool).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("Storage error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Whether this error is a uniqueness conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A message about to be appended. Storage assigns id and final timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub match_id: MatchId,
    pub sender_id: UserId,
    pub body: String,
    pub client_key: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// The likes table. Unique on `(liker, liked)`.
#[async_trait]
pub trait InterestStore: Send + Sync {
    /// Insert a like. Fails with `Conflict` if the row already exists.
    async fn insert_like(&self, like: &Like) -> Result<(), StoreError>;

    /// Find the like `liker -> liked`.
    async fn find_like(&self, liker: &UserId, liked: &UserId)
        -> Result<Option<Like>, StoreError>;

    /// Delete the like `liker -> liked`. Returns `true` if a row was removed.
    async fn delete_like(&self, liker: &UserId, liked: &UserId) -> Result<bool, StoreError>;

    /// Likes received by `user`, oldest first.
    async fn likes_to(&self, user: &UserId) -> Result<Vec<Like>, StoreError>;

    /// Likes sent by `user`, oldest first.
    async fn likes_from(&self, user: &UserId) -> Result<Vec<Like>, StoreError>;
}

/// The matches table. Unique on the canonical `(user_a, user_b)`.
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Insert a match. Fails with `Conflict` if the pair is already matched.
    async fn insert_match(&self, record: &Match) -> Result<(), StoreError>;

    /// Find the match for a canonical pair.
    async fn find_match_by_pair(&self, pair: &UserPair) -> Result<Option<Match>, StoreError>;

    /// Find a match by id.
    async fn find_match(&self, id: &MatchId) -> Result<Option<Match>, StoreError>;

    /// All matches touching `user`, newest first.
    async fn matches_for(&self, user: &UserId) -> Result<Vec<Match>, StoreError>;
}

/// The messages table. Append-only, ordered by `(created_at, id)`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message.
    ///
    /// The stored `created_at` is strictly greater than every earlier message
    /// in the same match. Fails with `Conflict` if the sender already used the
    /// same client key in this match.
    async fn insert_message(&self, new: &NewMessage) -> Result<Message, StoreError>;

    /// Find a message by the sender's idempotency key.
    async fn find_by_client_key(
        &self,
        match_id: &MatchId,
        sender: &UserId,
        client_key: &str,
    ) -> Result<Option<Message>, StoreError>;

    /// Messages with `created_at > after` in ascending order, at most `limit`.
    async fn messages_after(
        &self,
        match_id: &MatchId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// The most recent message of a match.
    async fn last_message(&self, match_id: &MatchId) -> Result<Option<Message>, StoreError>;

    /// Messages of every match with `id > after`, in insertion order.
    async fn messages_after_id(
        &self,
        after: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Highest message id ever assigned, or `MessageId(0)` for an empty log.
    async fn latest_message_id(&self) -> Result<MessageId, StoreError>;

    /// Count messages not sent by `reader` with `created_at > after`.
    async fn count_from_others(
        &self,
        match_id: &MatchId,
        reader: &UserId,
        after: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;
}

/// The read watermarks table. One row per `(user, match)`.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Insert or move a watermark forward.
    ///
    /// Returns `false` without writing when the stored value is already at or
    /// past `watermark.last_read_at`.
    async fn advance_watermark(&self, watermark: &ReadWatermark) -> Result<bool, StoreError>;

    /// Read the watermark of `user` in `match_id`.
    async fn find_watermark(
        &self,
        user: &UserId,
        match_id: &MatchId,
    ) -> Result<Option<ReadWatermark>, StoreError>;
}

/// Everything the services need from storage.
pub trait Store: InterestStore + MatchStore + MessageStore + WatermarkStore {}

impl<T> Store for T where T: InterestStore + MatchStore + MessageStore + WatermarkStore {}
