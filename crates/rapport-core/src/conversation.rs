//! Append-only message history per match.
//!
//! Appends commit to storage and only wake the delivery pump. The pump reads
//! committed rows in id order and publishes them, so subscribers of a
//! conversation see messages in the order they were stored even when both
//! participants write at once.

use crate::bus::Publisher;
use crate::error::CoreError;
use crate::event::Event;
use crate::model::{now, Match, MatchId, Message, MessageId, UserId};
use crate::store::{MessageStore, NewMessage, Store};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

const PUMP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Conversation configuration.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Maximum message body length in bytes.
    pub max_body_len: usize,
    /// Largest page `history` returns.
    pub max_page_size: usize,
    /// Rows the delivery pump reads per batch.
    pub pump_batch_size: usize,
    /// Fallback interval at which the pump polls without being woken.
    pub pump_poll_interval: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_body_len: 4096,
            max_page_size: 200,
            pump_batch_size: 256,
            pump_poll_interval: Duration::from_millis(250),
        }
    }
}

struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Durable, ordered message history scoped to a match.
pub struct ConversationLog<S> {
    store: Arc<S>,
    wake: Arc<Notify>,
    config: ConversationConfig,
    _pump: Arc<PumpGuard>,
}

impl<S> Clone for ConversationLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            wake: Arc::clone(&self.wake),
            config: self.config.clone(),
            _pump: Arc::clone(&self._pump),
        }
    }
}

impl<S: Store + 'static> ConversationLog<S> {
    /// Create the log and start its delivery pump.
    ///
    /// Messages stored before this call are history, not live events.
    ///
    /// # Errors
    ///
    /// Returns an error if the current end of the log cannot be read.
    pub async fn start(
        store: Arc<S>,
        publisher: Publisher,
        config: ConversationConfig,
    ) -> Result<Self, CoreError> {
        let cursor = store.latest_message_id().await?;
        let wake = Arc::new(Notify::new());

        let pump = tokio::spawn(run_pump(
            Arc::clone(&store),
            publisher,
            Arc::clone(&wake),
            cursor,
            config.pump_batch_size.max(1),
            config.pump_poll_interval,
        ));
        debug!(cursor = %cursor, "Message delivery pump started");

        Ok(Self {
            store,
            wake,
            config,
            _pump: Arc::new(PumpGuard(pump)),
        })
    }

    /// Append a message to a match.
    ///
    /// With a `client_key`, a retry of an append whose outcome was unknown
    /// returns the originally stored message instead of a duplicate.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty or oversized body, `NoSuchMatch`,
    /// `InvalidSender` if the sender is not a participant, `Storage`.
    pub async fn append(
        &self,
        match_id: &MatchId,
        sender: &UserId,
        body: &str,
        client_key: Option<&str>,
    ) -> Result<Message, CoreError> {
        if body.trim().is_empty() {
            return Err(CoreError::InvalidInput("message body is empty"));
        }
        if body.len() > self.config.max_body_len {
            return Err(CoreError::InvalidInput("message body is too long"));
        }
        if client_key.is_some_and(str::is_empty) {
            return Err(CoreError::InvalidInput("client key is empty"));
        }

        let matched = self.participant_match(match_id, sender).await?;

        if let Some(key) = client_key {
            if let Some(existing) = self.store.find_by_client_key(match_id, sender, key).await? {
                debug!(match_id = %match_id, client_key = key, "Duplicate append");
                return Ok(existing);
            }
        }

        let new = NewMessage {
            match_id: matched.id,
            sender_id: sender.clone(),
            body: body.to_string(),
            client_key: client_key.map(str::to_string),
            sent_at: now(),
        };

        match self.store.insert_message(&new).await {
            Ok(message) => {
                trace!(match_id = %match_id, id = %message.id, "Message appended");
                self.wake.notify_one();
                Ok(message)
            }
            // A concurrent retry with the same key won.
            Err(e) if e.is_conflict() => match client_key {
                Some(key) => self
                    .store
                    .find_by_client_key(match_id, sender, key)
                    .await?
                    .ok_or(CoreError::Storage(e)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// One page of messages after `since`, ascending by `(created_at, id)`.
    ///
    /// # Errors
    ///
    /// `NoSuchMatch` or `Storage`.
    pub async fn history(
        &self,
        match_id: &MatchId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, CoreError> {
        if self.store.find_match(match_id).await?.is_none() {
            return Err(CoreError::NoSuchMatch(*match_id));
        }
        let limit = limit.min(self.config.max_page_size);
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.store.messages_after(match_id, since, limit).await?)
    }

    /// The whole history after `since` as a lazy stream.
    ///
    /// Pages are fetched on demand. Restart from any checkpoint by passing the
    /// `created_at` of the last message seen.
    pub fn history_stream(
        &self,
        match_id: MatchId,
        since: Option<DateTime<Utc>>,
    ) -> impl Stream<Item = Result<Message, CoreError>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let page_size = self.config.max_page_size.max(1);

        stream::unfold(Some(since), move |cursor| {
            let store = Arc::clone(&store);
            async move {
                let after = cursor?;
                match store.messages_after(&match_id, after, page_size).await {
                    Ok(page) => {
                        let next = if page.len() < page_size {
                            None
                        } else {
                            page.last().map(|m| Some(m.created_at))
                        };
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(CoreError::from(e)), None)),
                }
            }
        })
        .flat_map(|page| {
            let items: Vec<Result<Message, CoreError>> = match page {
                Ok(messages) => messages.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
    }

    /// The latest message of a match, for previews.
    ///
    /// # Errors
    ///
    /// `Storage`.
    pub async fn last_message(&self, match_id: &MatchId) -> Result<Option<Message>, CoreError> {
        Ok(self.store.last_message(match_id).await?)
    }

    /// The match, if `user` takes part in it.
    ///
    /// # Errors
    ///
    /// `NoSuchMatch` or `InvalidSender`.
    async fn participant_match(&self, match_id: &MatchId, user: &UserId) -> Result<Match, CoreError> {
        let matched = self
            .store
            .find_match(match_id)
            .await?
            .ok_or(CoreError::NoSuchMatch(*match_id))?;

        if !matched.involves(user) {
            return Err(CoreError::InvalidSender {
                sender: user.clone(),
                match_id: *match_id,
            });
        }
        Ok(matched)
    }
}

/// Publish committed messages in id order.
async fn run_pump<S: MessageStore + ?Sized>(
    store: Arc<S>,
    publisher: Publisher,
    wake: Arc<Notify>,
    mut cursor: MessageId,
    batch_size: usize,
    poll_interval: Duration,
) {
    loop {
        match store.messages_after_id(cursor, batch_size).await {
            Ok(messages) => {
                let full = messages.len() == batch_size;
                for message in messages {
                    cursor = message.id;
                    publisher.publish(Event::MessageAppended { message });
                }
                if full {
                    continue;
                }
            }
            Err(e) => {
                error!(error = %e, cursor = %cursor, "Failed to read committed messages");
                tokio::time::sleep(PUMP_ERROR_BACKOFF).await;
                continue;
            }
        }

        tokio::select! {
            () = wake.notified() => {}
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, RealtimeBus};
    use crate::event::Scope;
    use crate::matching::MatchResolver;
    use crate::store::SqliteStore;
    use crate::test_support::drain;
    use futures_util::TryStreamExt;

    struct Fixture {
        log: ConversationLog<SqliteStore>,
        bus: RealtimeBus,
        matched: Match,
    }

    async fn fixture(config: ConversationConfig) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = RealtimeBus::new(BusConfig::default());
        let resolver = MatchResolver::new(Arc::clone(&store), bus.publisher());

        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        resolver.record_like(&alice, &bob).await.unwrap();
        let matched = resolver.accept_pending(&bob, &alice).await.unwrap().matched;

        let log = ConversationLog::start(store, bus.publisher(), config).await.unwrap();
        Fixture { log, bus, matched }
    }

    fn message_ids(events: &[Arc<Event>]) -> Vec<MessageId> {
        events
            .iter()
            .filter_map(|e| match e.as_ref() {
                Event::MessageAppended { message } => Some(message.id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_append_and_history() {
        let f = fixture(ConversationConfig::default()).await;
        let id = f.matched.id;

        let m1 = f.log.append(&id, &"alice".into(), "hi", None).await.unwrap();
        let m2 = f.log.append(&id, &"bob".into(), "hey", None).await.unwrap();

        let history = f.log.history(&id, None, 50).await.unwrap();
        assert_eq!(history, vec![m1.clone(), m2.clone()]);
        assert_eq!(f.log.last_message(&id).await.unwrap(), Some(m2));
    }

    #[tokio::test]
    async fn test_append_rejections() {
        let f = fixture(ConversationConfig {
            max_body_len: 8,
            ..Default::default()
        })
        .await;
        let id = f.matched.id;
        let alice = UserId::from("alice");

        let err = f.log.append(&id, &"mallory".into(), "hi", None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidSender { .. }));

        let err = f.log.append(&MatchId::generate(), &alice, "hi", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSuchMatch(_)));

        let err = f.log.append(&id, &alice, "   ", None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let err = f.log.append(&id, &alice, "far too long", None).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        assert!(f.log.history(&id, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_key_dedupes_retries() {
        let f = fixture(ConversationConfig::default()).await;
        let id = f.matched.id;
        let alice = UserId::from("alice");
        let mut live = f.bus.subscribe("conn-b", Scope::Conversation(id)).unwrap();

        let first = f.log.append(&id, &alice, "hello", Some("k-1")).await.unwrap();
        let retry = f.log.append(&id, &alice, "hello", Some("k-1")).await.unwrap();
        assert_eq!(first, retry);

        assert_eq!(f.log.history(&id, None, 10).await.unwrap().len(), 1);
        assert_eq!(message_ids(&drain(&mut live).await), vec![first.id]);
    }

    #[tokio::test]
    async fn test_reconnect_gap_fill() {
        let f = fixture(ConversationConfig::default()).await;
        let id = f.matched.id;

        let mut seen = Vec::new();
        for n in 0..5 {
            let sender = if n % 2 == 0 { "alice" } else { "bob" };
            seen.push(f.log.append(&id, &sender.into(), "msg", None).await.unwrap());
        }
        let checkpoint = seen.last().unwrap().created_at;

        // Client is offline for these two.
        let m6 = f.log.append(&id, &"bob".into(), "are you there", None).await.unwrap();
        let m7 = f.log.append(&id, &"bob".into(), "hello?", None).await.unwrap();

        let missed = f.log.history(&id, Some(checkpoint), 100).await.unwrap();
        assert_eq!(missed, vec![m6, m7]);
    }

    #[tokio::test]
    async fn test_history_stream_pages_and_restarts() {
        let f = fixture(ConversationConfig {
            max_page_size: 3,
            ..Default::default()
        })
        .await;
        let id = f.matched.id;

        let mut appended = Vec::new();
        for n in 0..8 {
            let body = format!("message {n}");
            appended.push(f.log.append(&id, &"alice".into(), &body, None).await.unwrap());
        }

        let all: Vec<Message> = f.log.history_stream(id, None).try_collect().await.unwrap();
        assert_eq!(all, appended);

        let rest: Vec<Message> = f
            .log
            .history_stream(id, Some(appended[4].created_at))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest, &appended[5..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_delivered_in_history_order() {
        let f = fixture(ConversationConfig::default()).await;
        let id = f.matched.id;
        let mut live = f.bus.subscribe("observer", Scope::Conversation(id)).unwrap();

        let mut tasks = Vec::new();
        for sender in ["alice", "bob"] {
            let log = f.log.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    let body = format!("{sender} {n}");
                    log.append(&id, &sender.into(), &body, None).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = f.log.history(&id, None, 100).await.unwrap();
        assert_eq!(history.len(), 50);
        assert!(history
            .windows(2)
            .all(|w| w[0].order_key() < w[1].order_key()));

        let delivered = message_ids(&drain(&mut live).await);
        let stored: Vec<MessageId> = history.iter().map(|m| m.id).collect();
        assert_eq!(delivered, stored);
    }

    #[tokio::test]
    async fn test_messages_before_start_are_not_replayed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = RealtimeBus::new(BusConfig::default());
        let resolver = MatchResolver::new(Arc::clone(&store), bus.publisher());
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));
        resolver.record_like(&alice, &bob).await.unwrap();
        let id = resolver.accept_pending(&bob, &alice).await.unwrap().matched.id;

        store
            .insert_message(&NewMessage {
                match_id: id,
                sender_id: alice.clone(),
                body: "before restart".to_string(),
                client_key: None,
                sent_at: now(),
            })
            .await
            .unwrap();

        let mut live = bus.subscribe("conn-b", Scope::Conversation(id)).unwrap();
        let log = ConversationLog::start(store, bus.publisher(), Default::default())
            .await
            .unwrap();
        let after = log.append(&id, &bob, "after restart", None).await.unwrap();

        assert_eq!(message_ids(&drain(&mut live).await), vec![after.id]);
    }
}
