//! Match resolution.
//!
//! A match is created exactly once per unordered pair. There is no lock: the
//! canonical pair is unique in storage, and a conflicting insert means another
//! caller won the race, so the existing row is fetched and returned.

use crate::bus::Publisher;
use crate::error::CoreError;
use crate::event::Event;
use crate::model::{now, Like, Match, MatchId, UserId, UserPair};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of recording a like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikeOutcome {
    /// The like is stored and waits for the other party.
    Pending(Like),
    /// The pair is matched.
    Matched {
        matched: Match,
        /// `true` only for the call that inserted the match row.
        created: bool,
    },
}

impl LikeOutcome {
    /// The match, if the pair is matched.
    #[must_use]
    pub fn matched(&self) -> Option<&Match> {
        match self {
            LikeOutcome::Pending(_) => None,
            LikeOutcome::Matched { matched, .. } => Some(matched),
        }
    }
}

/// Result of accepting a pending like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResolution {
    pub matched: Match,
    /// `true` only for the call that inserted the match row.
    pub created: bool,
}

/// Decides and persists whether two users are matched.
pub struct MatchResolver<S> {
    store: Arc<S>,
    publisher: Publisher,
}

impl<S> Clone for MatchResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            publisher: self.publisher.clone(),
        }
    }
}

impl<S: Store> MatchResolver<S> {
    /// Create a resolver over a store.
    pub fn new(store: Arc<S>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    /// Record that `liker` likes `liked`.
    ///
    /// Idempotent. If the reciprocal like exists the pair is matched.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty ids or a self-like; `Storage` for backend
    /// failures, which are safe to retry.
    pub async fn record_like(
        &self,
        liker: &UserId,
        liked: &UserId,
    ) -> Result<LikeOutcome, CoreError> {
        let pair = pair_of(liker, liked)?;

        if let Some(matched) = self.store.find_match_by_pair(&pair).await? {
            debug!(liker = %liker, liked = %liked, "Like on matched pair");
            return Ok(LikeOutcome::Matched {
                matched,
                created: false,
            });
        }

        let like = Like {
            liker: liker.clone(),
            liked: liked.clone(),
            created_at: now(),
        };

        let like = match self.store.insert_like(&like).await {
            Ok(()) => {
                debug!(liker = %liker, liked = %liked, "Like stored");
                self.publisher.publish(Event::LikeCreated { like: like.clone() });
                like
            }
            Err(e) if e.is_conflict() => self
                .store
                .find_like(liker, liked)
                .await?
                .unwrap_or(like),
            Err(e) => return Err(e.into()),
        };

        if self.store.find_like(liked, liker).await?.is_none() {
            // A concurrent accept may have matched the pair and consumed the reciprocal like.
            if let Some(matched) = self.store.find_match_by_pair(&pair).await? {
                return Ok(LikeOutcome::Matched {
                    matched,
                    created: false,
                });
            }
            return Ok(LikeOutcome::Pending(like));
        }

        let MatchResolution { matched, created } = self.insert_or_fetch(pair).await?;
        Ok(LikeOutcome::Matched { matched, created })
    }

    /// `user` accepts the pending like from `other`.
    ///
    /// Creates the match and deletes the pending like. Accepting an already
    /// matched pair returns the existing match.
    ///
    /// # Errors
    ///
    /// `NoPendingLike` if `other` never liked `user` and the pair is not matched.
    pub async fn accept_pending(
        &self,
        user: &UserId,
        other: &UserId,
    ) -> Result<MatchResolution, CoreError> {
        let pair = pair_of(user, other)?;

        let resolution = match self.store.find_match_by_pair(&pair).await? {
            Some(matched) => MatchResolution {
                matched,
                created: false,
            },
            None => {
                if self.store.find_like(other, user).await?.is_none() {
                    return Err(CoreError::NoPendingLike {
                        from: other.clone(),
                        to: user.clone(),
                    });
                }
                self.insert_or_fetch(pair).await?
            }
        };

        // Subsumed by the match. A failed delete is repaired by a retry.
        self.store.delete_like(other, user).await?;
        Ok(resolution)
    }

    /// `user` rejects the pending like from `other`.
    ///
    /// Returns whether a like was removed; rejecting nothing is not an error.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for bad ids; `Storage` for backend failures.
    pub async fn reject_pending(&self, user: &UserId, other: &UserId) -> Result<bool, CoreError> {
        pair_of(user, other)?;
        let removed = self.store.delete_like(other, user).await?;
        if removed {
            debug!(user = %user, other = %other, "Pending like rejected");
        }
        Ok(removed)
    }

    /// `liker` withdraws a pending like sent to `liked`.
    ///
    /// A like that already led to a match is kept; there is nothing pending
    /// to withdraw.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for bad ids; `Storage` for backend failures.
    pub async fn withdraw_like(&self, liker: &UserId, liked: &UserId) -> Result<bool, CoreError> {
        let pair = pair_of(liker, liked)?;
        if self.store.find_match_by_pair(&pair).await?.is_some() {
            return Ok(false);
        }
        Ok(self.store.delete_like(liker, liked).await?)
    }

    /// The match between two users, in either argument order.
    ///
    /// # Errors
    ///
    /// `Storage` for backend failures.
    pub async fn match_exists(&self, a: &UserId, b: &UserId) -> Result<Option<Match>, CoreError> {
        match UserPair::new(a.clone(), b.clone()) {
            Some(pair) => Ok(self.store.find_match_by_pair(&pair).await?),
            None => Ok(None),
        }
    }

    /// A match by id.
    ///
    /// # Errors
    ///
    /// `NoSuchMatch` if absent.
    pub async fn get(&self, id: &MatchId) -> Result<Match, CoreError> {
        self.store
            .find_match(id)
            .await?
            .ok_or(CoreError::NoSuchMatch(*id))
    }

    /// All matches of a user, newest first.
    ///
    /// # Errors
    ///
    /// `Storage` for backend failures.
    pub async fn matches_for(&self, user: &UserId) -> Result<Vec<Match>, CoreError> {
        Ok(self.store.matches_for(user).await?)
    }

    /// Likes received by `user` that are still waiting for an answer.
    ///
    /// # Errors
    ///
    /// `Storage` for backend failures.
    pub async fn pending_incoming(&self, user: &UserId) -> Result<Vec<Like>, CoreError> {
        let likes = self.store.likes_to(user).await?;
        self.unmatched(likes).await
    }

    /// Likes sent by `user` that are still waiting for an answer.
    ///
    /// # Errors
    ///
    /// `Storage` for backend failures.
    pub async fn pending_outgoing(&self, user: &UserId) -> Result<Vec<Like>, CoreError> {
        let likes = self.store.likes_from(user).await?;
        self.unmatched(likes).await
    }

    async fn unmatched(&self, likes: Vec<Like>) -> Result<Vec<Like>, CoreError> {
        let mut pending = Vec::with_capacity(likes.len());
        for like in likes {
            let Some(pair) = UserPair::new(like.liker.clone(), like.liked.clone()) else {
                continue;
            };
            if self.store.find_match_by_pair(&pair).await?.is_none() {
                pending.push(like);
            }
        }
        Ok(pending)
    }

    /// The single match creation routine shared by mutual likes and accepts.
    async fn insert_or_fetch(&self, pair: UserPair) -> Result<MatchResolution, CoreError> {
        let candidate = Match {
            id: MatchId::generate(),
            user_a: pair.low().clone(),
            user_b: pair.high().clone(),
            created_at: now(),
        };

        match self.store.insert_match(&candidate).await {
            Ok(()) => {
                info!(
                    match_id = %candidate.id,
                    user_a = %candidate.user_a,
                    user_b = %candidate.user_b,
                    "Match created"
                );
                self.publisher.publish(Event::MatchCreated {
                    matched: candidate.clone(),
                });
                Ok(MatchResolution {
                    matched: candidate,
                    created: true,
                })
            }
            Err(e) if e.is_conflict() => {
                debug!(user_a = %candidate.user_a, user_b = %candidate.user_b, "Pair already matched");
                let matched = self.store.find_match_by_pair(&pair).await?.ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "match for {}/{} conflicted but is missing",
                        pair.low(),
                        pair.high()
                    ))
                })?;
                Ok(MatchResolution {
                    matched,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn pair_of(a: &UserId, b: &UserId) -> Result<UserPair, CoreError> {
    if a.is_empty() || b.is_empty() {
        return Err(CoreError::InvalidInput("empty user id"));
    }
    UserPair::new(a.clone(), b.clone()).ok_or(CoreError::InvalidInput("cannot like yourself"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, RealtimeBus};
    use crate::event::Scope;
    use crate::store::{InterestStore, SqliteStore};
    use crate::test_support::drain;

    fn setup() -> (MatchResolver<SqliteStore>, Arc<SqliteStore>, RealtimeBus) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = RealtimeBus::new(BusConfig::default());
        let resolver = MatchResolver::new(Arc::clone(&store), bus.publisher());
        (resolver, store, bus)
    }

    #[tokio::test]
    async fn test_one_sided_like_is_pending() {
        let (resolver, _, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        let outcome = resolver.record_like(&alice, &bob).await.unwrap();
        assert!(matches!(outcome, LikeOutcome::Pending(ref like) if like.liked == bob));
        assert!(resolver.match_exists(&alice, &bob).await.unwrap().is_none());

        // Duplicate like is a no-op.
        let again = resolver.record_like(&alice, &bob).await.unwrap();
        assert!(matches!(again, LikeOutcome::Pending(_)));
        assert_eq!(resolver.pending_incoming(&bob).await.unwrap().len(), 1);
        assert_eq!(resolver.pending_outgoing(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutual_like_creates_one_match() {
        let (resolver, _, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        resolver.record_like(&bob, &alice).await.unwrap();
        let outcome = resolver.record_like(&alice, &bob).await.unwrap();

        let LikeOutcome::Matched { matched, created } = outcome else {
            panic!("expected a match");
        };
        assert!(created);
        assert_eq!(matched.user_a, alice);
        assert_eq!(matched.user_b, bob);

        let repeat = resolver.record_like(&bob, &alice).await.unwrap();
        assert_eq!(repeat.matched().map(|m| m.id), Some(matched.id));
        assert!(resolver.pending_incoming(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_match_exists_is_symmetric() {
        let (resolver, _, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        resolver.record_like(&alice, &bob).await.unwrap();
        resolver.record_like(&bob, &alice).await.unwrap();

        let ab = resolver.match_exists(&alice, &bob).await.unwrap();
        let ba = resolver.match_exists(&bob, &alice).await.unwrap();
        assert!(ab.is_some());
        assert_eq!(ab, ba);
        assert!(resolver.match_exists(&alice, &alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_like_rejected() {
        let (resolver, _, _bus) = setup();
        let alice = UserId::from("alice");

        let err = resolver.record_like(&alice, &alice).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let err = resolver.record_like(&alice, &UserId::from("")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutual_likes_create_exactly_one_match() {
        for round in 0..20 {
            let (resolver, _, bus) = setup();
            let alice = UserId::new(format!("alice-{round}"));
            let bob = UserId::new(format!("bob-{round}"));
            let mut created_events = bus.subscribe("observer", Scope::Matches(alice.clone())).unwrap();

            let mut tasks = Vec::new();
            for i in 0..8 {
                let resolver = resolver.clone();
                let (from, to) = if i % 2 == 0 {
                    (alice.clone(), bob.clone())
                } else {
                    (bob.clone(), alice.clone())
                };
                tasks.push(tokio::spawn(async move { resolver.record_like(&from, &to).await }));
            }

            let mut created = 0;
            let mut ids = Vec::new();
            for task in tasks {
                if let LikeOutcome::Matched { matched, created: c } = task.await.unwrap().unwrap() {
                    created += usize::from(c);
                    ids.push(matched.id);
                }
            }

            assert_eq!(created, 1, "round {round}");
            assert!(!ids.is_empty());
            assert!(ids.windows(2).all(|w| w[0] == w[1]));
            assert_eq!(resolver.matches_for(&alice).await.unwrap().len(), 1);
            assert_eq!(drain(&mut created_events).await.len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_accept_racing_reciprocal_like_creates_exactly_one_match() {
        for round in 0..50 {
            let (resolver, _, bus) = setup();
            let alice = UserId::new(format!("alice-{round}"));
            let bob = UserId::new(format!("bob-{round}"));
            let mut created_events = bus.subscribe("observer", Scope::Matches(alice.clone())).unwrap();

            resolver.record_like(&alice, &bob).await.unwrap();

            let accept = {
                let resolver = resolver.clone();
                let (bob, alice) = (bob.clone(), alice.clone());
                tokio::spawn(async move { resolver.accept_pending(&bob, &alice).await })
            };
            let like = {
                let resolver = resolver.clone();
                let (bob, alice) = (bob.clone(), alice.clone());
                tokio::spawn(async move { resolver.record_like(&bob, &alice).await })
            };

            let accepted = accept.await.unwrap().unwrap();
            let liked = like.await.unwrap().unwrap();
            let LikeOutcome::Matched { matched, created } = liked else {
                panic!("round {round}: reciprocal like left pending: {liked:?}");
            };

            assert_eq!(usize::from(accepted.created) + usize::from(created), 1, "round {round}");
            assert_eq!(matched.id, accepted.matched.id, "round {round}");
            assert_eq!(resolver.matches_for(&alice).await.unwrap().len(), 1);
            assert_eq!(drain(&mut created_events).await.len(), 1, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_accept_pending_scenario() {
        let (resolver, store, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        resolver.record_like(&alice, &bob).await.unwrap();
        let resolution = resolver.accept_pending(&bob, &alice).await.unwrap();
        assert!(resolution.created);

        assert_eq!(resolver.matches_for(&alice).await.unwrap().len(), 1);
        assert!(store.find_like(&alice, &bob).await.unwrap().is_none());

        // Retrying the accept returns the same match.
        let retry = resolver.accept_pending(&bob, &alice).await.unwrap();
        assert!(!retry.created);
        assert_eq!(retry.matched.id, resolution.matched.id);
    }

    #[tokio::test]
    async fn test_accept_without_pending_like() {
        let (resolver, _, _bus) = setup();
        let err = resolver
            .accept_pending(&UserId::from("bob"), &UserId::from("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoPendingLike { .. }));
    }

    #[tokio::test]
    async fn test_reject_scenario_allows_rerequest() {
        let (resolver, _, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        resolver.record_like(&alice, &bob).await.unwrap();
        assert!(resolver.reject_pending(&bob, &alice).await.unwrap());
        assert!(!resolver.reject_pending(&bob, &alice).await.unwrap());
        assert!(resolver.match_exists(&alice, &bob).await.unwrap().is_none());
        assert!(resolver.pending_incoming(&bob).await.unwrap().is_empty());

        let outcome = resolver.record_like(&alice, &bob).await.unwrap();
        assert!(matches!(outcome, LikeOutcome::Pending(_)));
    }

    #[tokio::test]
    async fn test_withdraw_like() {
        let (resolver, _, _bus) = setup();
        let (alice, bob, carol) = (
            UserId::from("alice"),
            UserId::from("bob"),
            UserId::from("carol"),
        );

        resolver.record_like(&alice, &bob).await.unwrap();
        assert!(resolver.withdraw_like(&alice, &bob).await.unwrap());
        assert!(resolver.pending_outgoing(&alice).await.unwrap().is_empty());

        // Matched likes are not pending and stay put.
        resolver.record_like(&alice, &carol).await.unwrap();
        resolver.record_like(&carol, &alice).await.unwrap();
        assert!(!resolver.withdraw_like(&alice, &carol).await.unwrap());
        assert!(resolver.match_exists(&alice, &carol).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_published() {
        let (resolver, _, bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        let mut bob_likes = bus.subscribe("conn-b", Scope::Likes(bob.clone())).unwrap();
        let mut bob_matches = bus.subscribe("conn-b", Scope::Matches(bob.clone())).unwrap();

        resolver.record_like(&alice, &bob).await.unwrap();
        resolver.record_like(&alice, &bob).await.unwrap();
        resolver.accept_pending(&bob, &alice).await.unwrap();

        let likes = drain(&mut bob_likes).await;
        assert_eq!(likes.len(), 1);
        assert!(matches!(likes[0].as_ref(), Event::LikeCreated { .. }));

        let matches = drain(&mut bob_matches).await;
        assert_eq!(matches.len(), 1);
        assert!(matches!(matches[0].as_ref(), Event::MatchCreated { .. }));
    }

    #[tokio::test]
    async fn test_storage_failure_is_not_treated_as_matched() {
        let (resolver, store, _bus) = setup();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        store
            .execute_batch(
                "CREATE TRIGGER fail_matches BEFORE INSERT ON matches
                 BEGIN SELECT RAISE(ABORT, 'disk unavailable'); END;",
            )
            .unwrap();

        resolver.record_like(&alice, &bob).await.unwrap();
        let err = resolver.record_like(&bob, &alice).await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(ref e) if !e.is_conflict()));
        assert!(err.is_retryable());
        assert!(resolver.match_exists(&alice, &bob).await.unwrap().is_none());

        // Retry succeeds once storage recovers.
        store.execute_batch("DROP TRIGGER fail_matches;").unwrap();
        let outcome = resolver.record_like(&bob, &alice).await.unwrap();
        assert!(matches!(outcome, LikeOutcome::Matched { created: true, .. }));
    }
}
