//! Domain records for Rapport.
//!
//! These are the rows of the four durable tables (likes, matches, messages,
//! read watermarks) plus the identifier newtypes that key them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable user identifier supplied by the profile service.
///
/// Ordering is lexicographic over the raw bytes; both participants of a pair
/// compute the same canonical order from it without coordination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a match, and therefore of its conversation.
///
/// Serialized as its hyphenated string form in every format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MatchId(pub Uuid);

impl MatchId {
    /// Generate a fresh match id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<MatchId> for String {
    fn from(id: MatchId) -> String {
        id.0.to_string()
    }
}

impl TryFrom<String> for MatchId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uuid::parse_str(&value).map(MatchId)
    }
}

/// Identifier of a message, assigned by storage in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An unordered pair of distinct users, stored canonically as `(low, high)`.
///
/// Deserialization goes through [`UserPair::new`], so a decoded pair is
/// always canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPair")]
pub struct UserPair {
    low: UserId,
    high: UserId,
}

#[derive(Deserialize)]
struct RawPair {
    low: UserId,
    high: UserId,
}

impl TryFrom<RawPair> for UserPair {
    type Error = &'static str;

    fn try_from(raw: RawPair) -> Result<Self, Self::Error> {
        UserPair::new(raw.low, raw.high).ok_or("a pair needs two distinct users")
    }
}

impl UserPair {
    /// Canonicalize two user ids into a pair.
    ///
    /// Returns `None` when both ids are the same user.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The lower id under the canonical order.
    #[must_use]
    pub fn low(&self) -> &UserId {
        &self.low
    }

    /// The higher id under the canonical order.
    #[must_use]
    pub fn high(&self) -> &UserId {
        &self.high
    }

    /// Whether `user` is one of the two.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }
}

/// A one-directional expression of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    pub liker: UserId,
    pub liked: UserId,
    pub created_at: DateTime<Utc>,
}

/// A symmetric pairing of two users. `user_a < user_b` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub created_at: DateTime<Utc>,
}

impl Match {
    /// Whether `user` participates in this match.
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    /// The counterpart of `user`, if `user` participates.
    #[must_use]
    pub fn other(&self, user: &UserId) -> Option<&UserId> {
        if &self.user_a == user {
            Some(&self.user_b)
        } else if &self.user_b == user {
            Some(&self.user_a)
        } else {
            None
        }
    }

    /// The canonical pair of this match.
    #[must_use]
    pub fn pair(&self) -> UserPair {
        UserPair {
            low: self.user_a.clone(),
            high: self.user_b.clone(),
        }
    }
}

/// A message in a match's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub match_id: MatchId,
    pub sender_id: UserId,
    pub body: String,
    /// Client-generated idempotency key, if the sender supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Ordering key within a conversation.
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// "I have seen everything up to `last_read_at` in this conversation."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWatermark {
    pub user_id: UserId,
    pub match_id: MatchId,
    pub last_read_at: DateTime<Utc>,
}

/// Current time truncated to the microsecond precision storage keeps.
#[must_use]
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Truncate a timestamp to microsecond precision.
#[must_use]
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(to_micros(ts)).unwrap_or(ts)
}

/// Microseconds since the Unix epoch.
#[must_use]
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Timestamp from microseconds since the Unix epoch.
#[must_use]
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoded_pair_is_canonical() {
        let pair: UserPair = serde_json::from_str(r#"{"low":"bob","high":"alice"}"#).unwrap();
        assert_eq!(pair.low().as_str(), "alice");
        assert_eq!(pair.high().as_str(), "bob");

        let same = serde_json::from_str::<UserPair>(r#"{"low":"bob","high":"bob"}"#);
        assert!(same.is_err());
    }

    #[test]
    fn test_pair_is_order_invariant() {
        let ab = UserPair::new("alice".into(), "bob".into()).unwrap();
        let ba = UserPair::new("bob".into(), "alice".into()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.low().as_str(), "alice");
        assert_eq!(ab.high().as_str(), "bob");
        assert!(ab.contains(&"bob".into()));
        assert!(!ab.contains(&"carol".into()));
    }

    #[test]
    fn test_pair_rejects_same_user() {
        assert!(UserPair::new("alice".into(), "alice".into()).is_none());
    }

    #[test]
    fn test_match_other() {
        let m = Match {
            id: MatchId::generate(),
            user_a: "alice".into(),
            user_b: "bob".into(),
            created_at: now(),
        };
        assert_eq!(m.other(&"alice".into()), Some(&UserId::from("bob")));
        assert_eq!(m.other(&"bob".into()), Some(&UserId::from("alice")));
        assert_eq!(m.other(&"carol".into()), None);
    }

    #[test]
    fn test_micros_round_trip_is_exact() {
        let ts = now();
        assert_eq!(from_micros(to_micros(ts)), Some(ts));

        let before_epoch = from_micros(-1_500_001).unwrap();
        assert_eq!(to_micros(before_epoch), -1_500_001);
    }

    #[test]
    fn test_match_id_parses_from_string() {
        let id = MatchId::generate();
        let parsed = MatchId::try_from(String::from(id)).unwrap();
        assert_eq!(parsed, id);
        assert!(MatchId::try_from("not-a-uuid".to_string()).is_err());
    }
}
