//! Read watermarks and unread counts.
//!
//! Counts are derived on demand from the watermark and the log, never stored.
//! A mark-read racing an incoming message may cover it; that is accepted.

use crate::bus::Publisher;
use crate::error::CoreError;
use crate::event::Event;
use crate::model::{now, truncate, Match, MatchId, Message, ReadWatermark, UserId};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::trace;

/// Result of a mark-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The watermark moved forward.
    Advanced(ReadWatermark),
    /// The stored watermark was already at or past the requested point.
    Stale,
}

/// One row of a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPreview {
    pub matched: Match,
    pub last_message: Option<Message>,
    pub unread: u64,
}

impl ConversationPreview {
    /// Time of the latest activity: last message, or match creation.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map_or(self.matched.created_at, |m| m.created_at)
    }
}

/// Tracks per-user, per-conversation read progress.
pub struct ReadTracker<S> {
    store: Arc<S>,
    publisher: Publisher,
}

impl<S> Clone for ReadTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            publisher: self.publisher.clone(),
        }
    }
}

impl<S: Store> ReadTracker<S> {
    pub fn new(store: Arc<S>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    /// Mark everything up to `at` as read.
    ///
    /// Moving the watermark backwards is a no-op, so a stale retry cannot
    /// undo a newer read. An `at` in the future is clamped to the newest
    /// point the conversation has reached, so messages sent later still count.
    ///
    /// # Errors
    ///
    /// `NoSuchMatch`, `NotParticipant` or `Storage`.
    pub async fn mark_read(
        &self,
        user: &UserId,
        match_id: &MatchId,
        at: DateTime<Utc>,
    ) -> Result<ReadOutcome, CoreError> {
        self.participant_match(user, match_id).await?;

        let at = self.clamp_to_present(match_id, at).await?;
        let watermark = ReadWatermark {
            user_id: user.clone(),
            match_id: *match_id,
            last_read_at: truncate(at),
        };

        if !self.store.advance_watermark(&watermark).await? {
            trace!(user = %user, match_id = %match_id, "Stale mark-read ignored");
            return Ok(ReadOutcome::Stale);
        }

        self.publisher.publish(Event::ReadUpdated {
            watermark: watermark.clone(),
        });
        Ok(ReadOutcome::Advanced(watermark))
    }

    // Stored timestamps can run a few microseconds ahead of the clock under
    // bursts, so the ceiling is the later of now and the last message.
    async fn clamp_to_present(
        &self,
        match_id: &MatchId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CoreError> {
        let present = now();
        if at <= present {
            return Ok(at);
        }
        let newest = self
            .store
            .last_message(match_id)
            .await?
            .map_or(present, |m| m.created_at.max(present));
        if at > newest {
            trace!(match_id = %match_id, requested = %at, "Future mark-read clamped");
        }
        Ok(at.min(newest))
    }

    /// Messages from the other participant after the user's watermark.
    ///
    /// Without a watermark every message from the other participant counts.
    ///
    /// # Errors
    ///
    /// `NoSuchMatch`, `NotParticipant` or `Storage`.
    pub async fn unread_count(&self, user: &UserId, match_id: &MatchId) -> Result<u64, CoreError> {
        self.participant_match(user, match_id).await?;
        self.count_unread(user, match_id).await
    }

    /// The stored watermark, if any.
    ///
    /// # Errors
    ///
    /// `Storage`.
    pub async fn watermark(
        &self,
        user: &UserId,
        match_id: &MatchId,
    ) -> Result<Option<ReadWatermark>, CoreError> {
        Ok(self.store.find_watermark(user, match_id).await?)
    }

    /// Previews of every conversation of `user`, most recent activity first.
    ///
    /// # Errors
    ///
    /// `Storage`.
    pub async fn inbox(&self, user: &UserId) -> Result<Vec<ConversationPreview>, CoreError> {
        let matches = self.store.matches_for(user).await?;
        let mut previews = Vec::with_capacity(matches.len());

        for matched in matches {
            let last_message = self.store.last_message(&matched.id).await?;
            let unread = self.count_unread(user, &matched.id).await?;
            previews.push(ConversationPreview {
                matched,
                last_message,
                unread,
            });
        }

        previews.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        Ok(previews)
    }

    async fn count_unread(&self, user: &UserId, match_id: &MatchId) -> Result<u64, CoreError> {
        let after = self
            .store
            .find_watermark(user, match_id)
            .await?
            .map(|w| w.last_read_at);
        Ok(self.store.count_from_others(match_id, user, after).await?)
    }

    async fn participant_match(&self, user: &UserId, match_id: &MatchId) -> Result<Match, CoreError> {
        let matched = self
            .store
            .find_match(match_id)
            .await?
            .ok_or(CoreError::NoSuchMatch(*match_id))?;

        if !matched.involves(user) {
            return Err(CoreError::NotParticipant {
                user: user.clone(),
                match_id: *match_id,
            });
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, RealtimeBus};
    use crate::conversation::{ConversationConfig, ConversationLog};
    use crate::event::Scope;
    use crate::matching::MatchResolver;
    use crate::model::now;
    use crate::store::SqliteStore;
    use crate::test_support::drain;
    use chrono::Duration;

    struct Fixture {
        tracker: ReadTracker<SqliteStore>,
        log: ConversationLog<SqliteStore>,
        resolver: MatchResolver<SqliteStore>,
        bus: RealtimeBus,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = RealtimeBus::new(BusConfig::default());
        let resolver = MatchResolver::new(Arc::clone(&store), bus.publisher());
        let log = ConversationLog::start(
            Arc::clone(&store),
            bus.publisher(),
            ConversationConfig::default(),
        )
        .await
        .unwrap();
        let tracker = ReadTracker::new(store, bus.publisher());
        Fixture {
            tracker,
            log,
            resolver,
            bus,
        }
    }

    async fn matched(f: &Fixture, a: &str, b: &str) -> MatchId {
        f.resolver.record_like(&a.into(), &b.into()).await.unwrap();
        f.resolver
            .record_like(&b.into(), &a.into())
            .await
            .unwrap()
            .matched()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_unread_counts_other_participant_only() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        for _ in 0..3 {
            f.log.append(&id, &bob, "ping", None).await.unwrap();
        }
        f.log.append(&id, &alice, "pong", None).await.unwrap();

        assert_eq!(f.tracker.unread_count(&alice, &id).await.unwrap(), 3);
        assert_eq!(f.tracker.unread_count(&bob, &id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_clears_and_new_messages_count() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        let last = f.log.append(&id, &bob, "one", None).await.unwrap();
        let outcome = f.tracker.mark_read(&alice, &id, last.created_at).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Advanced(_)));
        assert_eq!(f.tracker.unread_count(&alice, &id).await.unwrap(), 0);

        for _ in 0..4 {
            f.log.append(&id, &bob, "more", None).await.unwrap();
        }
        assert_eq!(f.tracker.unread_count(&alice, &id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_future_mark_read_does_not_hide_later_messages() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        let far = now() + Duration::days(365);
        f.tracker.mark_read(&alice, &id, far).await.unwrap();
        let stored = f.tracker.watermark(&alice, &id).await.unwrap().unwrap();
        assert!(stored.last_read_at < far);

        for _ in 0..3 {
            f.log.append(&id, &bob, "later", None).await.unwrap();
        }
        assert_eq!(f.tracker.unread_count(&alice, &id).await.unwrap(), 3);

        let outcome = f.tracker.mark_read(&alice, &id, now()).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Advanced(_)));
        assert_eq!(f.tracker.unread_count(&alice, &id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watermark_never_decreases() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;
        let alice = UserId::from("alice");
        let t = now();

        f.tracker.mark_read(&alice, &id, t).await.unwrap();
        for back in [0, 1, 30, 3600] {
            let outcome = f
                .tracker
                .mark_read(&alice, &id, t - Duration::seconds(back))
                .await
                .unwrap();
            assert_eq!(outcome, ReadOutcome::Stale);
            let stored = f.tracker.watermark(&alice, &id).await.unwrap().unwrap();
            assert_eq!(stored.last_read_at, truncate(t));
        }
    }

    #[tokio::test]
    async fn test_mark_read_requires_participant() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;

        let err = f
            .tracker
            .mark_read(&"mallory".into(), &id, now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotParticipant { .. }));

        let err = f
            .tracker
            .unread_count(&"alice".into(), &MatchId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSuchMatch(_)));
    }

    #[tokio::test]
    async fn test_only_advances_publish() {
        let f = fixture().await;
        let id = matched(&f, "alice", "bob").await;
        let alice = UserId::from("alice");
        let mut read_state = f.bus.subscribe("conn-a", Scope::ReadState(alice.clone())).unwrap();

        let t = now();
        f.tracker.mark_read(&alice, &id, t).await.unwrap();
        f.tracker.mark_read(&alice, &id, t).await.unwrap();

        let events = drain(&mut read_state).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].as_ref(), Event::ReadUpdated { .. }));
    }

    #[tokio::test]
    async fn test_inbox_orders_by_activity() {
        let f = fixture().await;
        let with_bob = matched(&f, "alice", "bob").await;
        let with_carol = matched(&f, "alice", "carol").await;
        let alice = UserId::from("alice");

        f.log.append(&with_carol, &"carol".into(), "first", None).await.unwrap();
        f.log.append(&with_bob, &"bob".into(), "second", None).await.unwrap();
        f.log.append(&with_bob, &"bob".into(), "third", None).await.unwrap();

        let inbox = f.tracker.inbox(&alice).await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].matched.id, with_bob);
        assert_eq!(inbox[0].unread, 2);
        assert_eq!(inbox[0].last_message.as_ref().map(|m| m.body.as_str()), Some("third"));
        assert_eq!(inbox[1].matched.id, with_carol);
        assert_eq!(inbox[1].unread, 1);
    }
}
