//! Typing indicators.
//!
//! The sender only ever pings; there is no "stopped typing" event. The
//! receiver clears an indicator once no ping has arrived for the expiry
//! window, see [`TypingIndicator`].

use crate::bus::Publisher;
use crate::event::Event;
use crate::model::{MatchId, UserId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default window after which a receiver drops an indicator.
pub const TYPING_EXPIRY: Duration = Duration::from_millis(1500);

/// Typing configuration.
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Pings for the same `(match, user)` closer than this are coalesced.
    pub throttle: Duration,
    /// Receiver-side expiry.
    pub expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(500),
            expiry: TYPING_EXPIRY,
        }
    }
}

/// Sender side: broadcasts typing pings, never stores them.
#[derive(Clone)]
pub struct TypingSignal {
    last_sent: Arc<DashMap<(MatchId, UserId), Instant>>,
    publisher: Publisher,
    throttle: Duration,
}

impl TypingSignal {
    #[must_use]
    pub fn new(publisher: Publisher, config: &TypingConfig) -> Self {
        Self {
            last_sent: Arc::new(DashMap::new()),
            publisher,
            throttle: config.throttle,
        }
    }

    /// Broadcast that `from` is typing in `match_id`.
    ///
    /// Returns `false` if the ping was coalesced into a recent one.
    pub fn notify_typing(&self, match_id: MatchId, from: &UserId) -> bool {
        let now = Instant::now();
        let key = (match_id, from.clone());

        if let Some(last) = self.last_sent.get(&key) {
            if now.duration_since(*last) < self.throttle {
                trace!(match_id = %match_id, from = %from, "Typing ping throttled");
                return false;
            }
        }
        self.last_sent.insert(key, now);

        self.publisher.publish(Event::TypingPinged {
            match_id,
            from: from.clone(),
        });
        true
    }

    /// Forget throttle entries older than the throttle window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.last_sent
            .retain(|_, last| now.duration_since(*last) < self.throttle);
    }

    /// Number of throttle entries held.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.last_sent.len()
    }
}

/// Receiver side: who is typing where, with automatic expiry.
///
/// Owned by one client connection; not shared.
#[derive(Debug)]
pub struct TypingIndicator {
    me: UserId,
    expiry: Duration,
    deadlines: HashMap<(MatchId, UserId), Instant>,
}

impl TypingIndicator {
    #[must_use]
    pub fn new(me: UserId, expiry: Duration) -> Self {
        Self {
            me,
            expiry,
            deadlines: HashMap::new(),
        }
    }

    /// Feed a delivered event.
    ///
    /// A ping (re)arms the indicator; a message from the typist clears it.
    /// Returns `true` if the visible state changed.
    pub fn observe(&mut self, event: &Event) -> bool {
        match event {
            Event::TypingPinged { match_id, from } => self.record(*match_id, from),
            Event::MessageAppended { message } => self
                .deadlines
                .remove(&(message.match_id, message.sender_id.clone()))
                .is_some(),
            _ => false,
        }
    }

    /// Arm the indicator for `from` in `match_id`. Own pings are ignored.
    ///
    /// Returns `true` if `from` was not already shown as typing.
    pub fn record(&mut self, match_id: MatchId, from: &UserId) -> bool {
        if *from == self.me {
            return false;
        }
        let now = Instant::now();
        let deadline = now + self.expiry;
        self.deadlines
            .insert((match_id, from.clone()), deadline)
            .map_or(true, |previous| previous <= now)
    }

    /// Whether `user` is shown as typing in `match_id`.
    #[must_use]
    pub fn is_typing(&self, match_id: MatchId, user: &UserId) -> bool {
        self.deadlines
            .get(&(match_id, user.clone()))
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Users shown as typing in `match_id`.
    #[must_use]
    pub fn typing_in(&self, match_id: MatchId) -> Vec<UserId> {
        let now = Instant::now();
        self.deadlines
            .iter()
            .filter(|((id, _), deadline)| *id == match_id && **deadline > now)
            .map(|((_, user), _)| user.clone())
            .collect()
    }

    /// Drop expired indicators and return them.
    pub fn clear_expired(&mut self) -> Vec<(MatchId, UserId)> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }

    /// Earliest pending expiry, for `tokio::time::sleep_until`.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, Delivery, RealtimeBus};
    use crate::event::Scope;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_coalesces_pings() {
        let bus = RealtimeBus::new(BusConfig::default());
        let signal = TypingSignal::new(bus.publisher(), &TypingConfig::default());
        let (id, alice) = (MatchId::generate(), UserId::from("alice"));

        assert!(signal.notify_typing(id, &alice));
        assert!(!signal.notify_typing(id, &alice));
        assert!(signal.notify_typing(id, &"bob".into()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(signal.notify_typing(id, &alice));

        tokio::time::advance(Duration::from_secs(1)).await;
        signal.sweep();
        assert_eq!(signal.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_ping_expires_without_stop_event() {
        let bus = RealtimeBus::new(BusConfig::default());
        let signal = TypingSignal::new(bus.publisher(), &TypingConfig::default());
        let id = MatchId::generate();
        let (alice, bob) = (UserId::from("alice"), UserId::from("bob"));

        let (sink, mut deliveries) = mpsc::unbounded_channel();
        let _sub = bus.attach("conn-bob", Scope::Typing(id), sink).unwrap();
        let mut indicator = TypingIndicator::new(bob, TYPING_EXPIRY);

        signal.notify_typing(id, &alice);
        let Some(Delivery::Event(event)) = deliveries.recv().await else {
            panic!("expected typing ping");
        };
        assert!(indicator.observe(&event));
        assert!(indicator.is_typing(id, &alice));

        // Nothing else arrives; the indicator clears by itself.
        let deadline = indicator.next_deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        assert!(!indicator.is_typing(id, &alice));
        assert_eq!(indicator.clear_expired(), vec![(id, alice)]);
        assert!(indicator.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_pings_extend() {
        let id = MatchId::generate();
        let alice = UserId::from("alice");
        let mut indicator = TypingIndicator::new("bob".into(), TYPING_EXPIRY);

        assert!(indicator.record(id, &alice));
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(!indicator.record(id, &alice));
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(indicator.is_typing(id, &alice));
        assert_eq!(indicator.typing_in(id), vec![alice.clone()]);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!indicator.is_typing(id, &alice));
    }

    #[tokio::test]
    async fn test_own_pings_ignored_and_message_clears() {
        let id = MatchId::generate();
        let mut indicator = TypingIndicator::new("bob".into(), TYPING_EXPIRY);

        assert!(!indicator.record(id, &"bob".into()));
        assert!(indicator.typing_in(id).is_empty());

        indicator.record(id, &"alice".into());
        let message = crate::model::Message {
            id: crate::model::MessageId(1),
            match_id: id,
            sender_id: "alice".into(),
            body: "done typing".into(),
            client_key: None,
            created_at: crate::model::now(),
        };
        assert!(indicator.observe(&Event::MessageAppended { message }));
        assert!(indicator.typing_in(id).is_empty());
    }
}
