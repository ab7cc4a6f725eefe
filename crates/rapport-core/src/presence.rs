//! Presence tracking for Rapport.
//!
//! Presence is ephemeral: it lives only in this map and is rebuilt from
//! scratch after a restart. Each user may hold several connections (devices,
//! tabs); the user is online while any of them is live.

use crate::bus::{ConnectionId, Publisher};
use crate::event::Event;
use crate::model::UserId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Presence configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// A connection without a heartbeat for this long is considered gone.
    pub ttl: Duration,
    /// How often the reaper prunes stale connections.
    pub reap_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(45),
            reap_interval: Duration::from_secs(15),
        }
    }
}

/// Online state per user, coalesced over that user's connections.
#[derive(Clone)]
pub struct PresenceHub {
    /// user -> (connection -> last heartbeat)
    users: Arc<DashMap<UserId, HashMap<ConnectionId, Instant>>>,
    publisher: Publisher,
    config: PresenceConfig,
}

impl PresenceHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(publisher: Publisher, config: PresenceConfig) -> Self {
        Self {
            users: Arc::new(DashMap::new()),
            publisher,
            config,
        }
    }

    /// Announce a live connection.
    ///
    /// Returns `true` if the user just came online.
    pub fn join(&self, user: &UserId, connection_id: &str) -> bool {
        let came_online = {
            let mut conns = self.users.entry(user.clone()).or_default();
            let was_empty = conns.is_empty();
            conns.insert(connection_id.to_string(), Instant::now());
            was_empty
        };

        debug!(user = %user, connection = %connection_id, "Presence: connection joined");
        if came_online {
            self.announce(user, true);
        }
        came_online
    }

    /// Withdraw a connection.
    ///
    /// Returns `true` if the user just went offline.
    pub fn leave(&self, user: &UserId, connection_id: &str) -> bool {
        let emptied = match self.users.get_mut(user) {
            Some(mut conns) => conns.remove(connection_id).is_some() && conns.is_empty(),
            None => return false,
        };

        debug!(user = %user, connection = %connection_id, "Presence: connection left");
        if emptied && self.users.remove_if(user, |_, conns| conns.is_empty()).is_some() {
            self.announce(user, false);
            return true;
        }
        false
    }

    /// Refresh a connection's heartbeat.
    ///
    /// A heartbeat from a connection that was pruned re-joins it. Returns
    /// `true` if the user came online as a result.
    pub fn heartbeat(&self, user: &UserId, connection_id: &str) -> bool {
        if let Some(mut conns) = self.users.get_mut(user) {
            if let Some(last_seen) = conns.get_mut(connection_id) {
                *last_seen = Instant::now();
                return false;
            }
        }
        self.join(user, connection_id)
    }

    /// Whether any connection of the user is live.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.get(user).is_some_and(|conns| !conns.is_empty())
    }

    /// Number of live connections of a user.
    #[must_use]
    pub fn connection_count(&self, user: &UserId) -> usize {
        self.users.get(user).map_or(0, |conns| conns.len())
    }

    /// Snapshot of online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop connections whose last heartbeat is older than the TTL.
    ///
    /// Returns the users that went offline.
    pub fn prune_stale(&self) -> Vec<UserId> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut emptied = Vec::new();

        for mut entry in self.users.iter_mut() {
            entry.value_mut().retain(|connection, last_seen| {
                let live = now.duration_since(*last_seen) <= ttl;
                if !live {
                    debug!(connection = %connection, "Presence: pruned stale connection");
                }
                live
            });
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }

        let mut offline = Vec::new();
        for user in emptied {
            if self.users.remove_if(&user, |_, conns| conns.is_empty()).is_some() {
                self.announce(&user, false);
                offline.push(user);
            }
        }
        offline
    }

    /// Run [`PresenceHub::prune_stale`] every `reap_interval`.
    #[must_use]
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.reap_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let offline = hub.prune_stale();
                if !offline.is_empty() {
                    debug!(count = offline.len(), "Presence: reaped silent users");
                }
            }
        })
    }

    fn announce(&self, user: &UserId, online: bool) {
        self.publisher.publish(Event::PresenceChanged {
            user_id: user.clone(),
            online,
        });
    }
}
