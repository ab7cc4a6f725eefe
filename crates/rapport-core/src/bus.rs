//! Realtime fan-out for Rapport.
//!
//! Writers hand events to a [`Publisher`], which never blocks: each
//! [`EventKind`] has its own unbounded queue drained by a single dispatcher
//! task. The dispatcher routes every event to the broadcast channel of each
//! [`Scope`] it touches. Subscribers hold a broadcast receiver per scope,
//! either directly or through a forwarding task owned by a
//! [`SubscriptionHandle`].
//!
//! ```text
//!  writer ─▶ Publisher ─▶ queue[kind] ─▶ dispatcher ─▶ scope channel ─▶ subscriber
//! ```
//!
//! A subscriber that falls behind the channel capacity receives
//! [`Delivery::Lagged`] instead of the dropped events. For durable scopes the
//! consumer recovers by re-reading history; the writer is never told.

use crate::event::{Event, EventKind, Scope};
use dashmap::{DashMap, DashSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Identifier of one client connection (a device or tab).
pub type ConnectionId = String;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Not subscribed to scope.
    #[error("Not subscribed to scope: {0}")]
    NotSubscribed(Scope),

    /// Already subscribed to scope.
    #[error("Already subscribed to scope: {0}")]
    AlreadySubscribed(Scope),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum scopes one connection may subscribe to.
    pub max_subscriptions_per_connection: usize,
    /// Broadcast capacity of each scope channel.
    pub scope_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 256,
            scope_capacity: 1024,
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An event on one of the subscribed scopes.
    Event(Arc<Event>),
    /// The subscriber fell behind; `missed` events on `scope` were dropped.
    Lagged { scope: Scope, missed: u64 },
}

/// Cheap handle writers use to hand events to the bus.
#[derive(Clone)]
pub struct Publisher {
    queues: Arc<HashMap<EventKind, mpsc::UnboundedSender<Event>>>,
}

impl Publisher {
    /// Enqueue an event for fan-out.
    ///
    /// Never blocks and never fails towards the caller; if the bus has shut
    /// down the event is logged and dropped.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let Some(queue) = self.queues.get(&kind) else {
            warn!(kind = kind.as_str(), "No queue for event kind, dropping");
            return;
        };

        if queue.send(event).is_err() {
            warn!(kind = kind.as_str(), "Bus stopped, dropping event");
        }
    }
}

/// One scope's broadcast channel and its subscribers.
struct ScopeEntry {
    sender: broadcast::Sender<Arc<Event>>,
    subscribers: HashSet<ConnectionId>,
}

impl ScopeEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

struct BusInner {
    /// Scopes with at least one subscriber.
    scopes: DashMap<Scope, ScopeEntry>,
    /// Connection subscriptions (connection_id -> set of scopes).
    subscriptions: DashMap<ConnectionId, DashSet<Scope>>,
    config: BusConfig,
}

impl BusInner {
    /// Route one event to every scope it touches.
    ///
    /// Returns the number of receivers reached.
    fn dispatch(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut reached = 0;

        for scope in event.scopes() {
            if let Some(entry) = self.scopes.get(&scope) {
                let count = entry.sender.send(Arc::clone(&event)).unwrap_or_default();
                trace!(scope = %scope, recipients = count, "Dispatched event");
                reached += count;
            }
        }

        reached
    }

    /// Remove one connection from one scope, deleting the scope if it empties.
    fn detach(&self, connection_id: &str, scope: &Scope) {
        if let Some(mut entry) = self.scopes.get_mut(scope) {
            entry.subscribers.remove(connection_id);

            if entry.subscribers.is_empty() {
                drop(entry);
                self.scopes
                    .remove_if(scope, |_, entry| entry.subscribers.is_empty());
                debug!(scope = %scope, "Removed empty scope");
            }
        }
    }
}

/// The realtime fan-out bus.
///
/// Cloning is cheap; all clones share the same scopes and queues.
#[derive(Clone)]
pub struct RealtimeBus {
    inner: Arc<BusInner>,
    publisher: Publisher,
}

impl RealtimeBus {
    /// Create a bus and start one dispatcher task per event kind.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        info!("Creating realtime bus with config: {:?}", config);

        let inner = Arc::new(BusInner {
            scopes: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        });

        let mut queues = HashMap::new();
        for kind in EventKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(kind, tx);
            tokio::spawn(run_dispatcher(kind, rx, Arc::clone(&inner)));
        }

        Self {
            inner,
            publisher: Publisher {
                queues: Arc::new(queues),
            },
        }
    }

    /// A publisher handle for writers.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Enqueue an event for fan-out.
    pub fn publish(&self, event: Event) {
        self.publisher.publish(event);
    }

    /// Subscribe a connection to a scope.
    ///
    /// Returns a receiver for events on the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if already subscribed or the per-connection limit is hit.
    pub fn subscribe(
        &self,
        connection_id: &str,
        scope: Scope,
    ) -> Result<broadcast::Receiver<Arc<Event>>, BusError> {
        let conn_subs = self
            .inner
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();

        if conn_subs.contains(&scope) {
            return Err(BusError::AlreadySubscribed(scope));
        }

        if conn_subs.len() >= self.inner.config.max_subscriptions_per_connection {
            return Err(BusError::MaxSubscriptionsReached);
        }

        let mut entry = self.inner.scopes.entry(scope.clone()).or_insert_with(|| {
            debug!(scope = %scope, "Creating scope");
            ScopeEntry::new(self.inner.config.scope_capacity)
        });

        let receiver = entry.sender.subscribe();
        entry.subscribers.insert(connection_id.to_string());
        conn_subs.insert(scope.clone());

        debug!(
            scope = %scope,
            connection = %connection_id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );

        Ok(receiver)
    }

    /// Subscribe and spawn a consumer task forwarding deliveries into `sink`.
    ///
    /// The returned handle owns the registration; cancelling or dropping it
    /// releases the scope.
    ///
    /// # Errors
    ///
    /// Same as [`RealtimeBus::subscribe`].
    pub fn attach(
        &self,
        connection_id: &str,
        scope: Scope,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionHandle, BusError> {
        let receiver = self.subscribe(connection_id, scope.clone())?;
        let task = tokio::spawn(forward(scope.clone(), receiver, sink));

        Ok(SubscriptionHandle {
            bus: self.clone(),
            connection_id: connection_id.to_string(),
            scope,
            task: Some(task),
        })
    }

    /// Unsubscribe a connection from a scope.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, scope: &Scope) -> Result<(), BusError> {
        let removed = self
            .inner
            .subscriptions
            .get(connection_id)
            .and_then(|subs| subs.remove(scope));

        if removed.is_none() {
            return Err(BusError::NotSubscribed(scope.clone()));
        }
        self.inner
            .subscriptions
            .remove_if(connection_id, |_, subs| subs.is_empty());

        self.inner.detach(connection_id, scope);
        debug!(scope = %scope, connection = %connection_id, "Unsubscribed");
        Ok(())
    }

    /// Unsubscribe a connection from all scopes.
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, scopes)) = self.inner.subscriptions.remove(connection_id) {
            for scope in scopes.iter() {
                self.inner.detach(connection_id, &scope);
            }
        }

        debug!(connection = %connection_id, "Unsubscribed from all scopes");
    }

    /// Whether a scope currently has subscribers.
    #[must_use]
    pub fn scope_exists(&self, scope: &Scope) -> bool {
        self.inner.scopes.contains_key(scope)
    }

    /// Number of connections subscribed to a scope.
    #[must_use]
    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.inner
            .scopes
            .get(scope)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Scopes a connection is subscribed to.
    #[must_use]
    pub fn connection_scopes(&self, connection_id: &str) -> Vec<Scope> {
        self.inner
            .subscriptions
            .get(connection_id)
            .map(|s| s.iter().map(|scope| scope.clone()).collect())
            .unwrap_or_default()
    }

    /// Bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            scope_count: self.inner.scopes.len(),
            connection_count: self.inner.subscriptions.len(),
            total_subscriptions: self.inner.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Route an event on the caller's task, bypassing the kind queues.
    ///
    /// Gives no ordering relative to queued events. Returns the number of
    /// receivers reached.
    pub fn dispatch_now(&self, event: Event) -> usize {
        self.inner.dispatch(event)
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Number of scopes with subscribers.
    pub scope_count: usize,
    /// Number of connections with at least one subscription.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

/// A live subscription with its consumer task.
pub struct SubscriptionHandle {
    bus: RealtimeBus,
    connection_id: ConnectionId,
    scope: Scope,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// The subscribed scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Cancel the subscription and wait for its consumer task to stop.
    ///
    /// Once this returns nothing references the subscription any more.
    pub async fn cancel(mut self) {
        if let Some(task) = self.release() {
            let _ = task.await;
        }
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        let task = self.task.take()?;
        task.abort();
        // Already gone if the connection was swept by unsubscribe_all.
        let _ = self.bus.unsubscribe(&self.connection_id, &self.scope);
        Some(task)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_dispatcher(
    kind: EventKind,
    mut queue: mpsc::UnboundedReceiver<Event>,
    inner: Arc<BusInner>,
) {
    while let Some(event) = queue.recv().await {
        inner.dispatch(event);
    }
    debug!(kind = kind.as_str(), "Dispatcher stopped");
}

async fn forward(
    scope: Scope,
    mut receiver: broadcast::Receiver<Arc<Event>>,
    sink: mpsc::UnboundedSender<Delivery>,
) {
    loop {
        let delivery = match receiver.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(scope = %scope, missed, "Subscriber lagged, events dropped");
                Delivery::Lagged {
                    scope: scope.clone(),
                    missed,
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if sink.send(delivery).is_err() {
            break; // Connection gone
        }
    }
}
