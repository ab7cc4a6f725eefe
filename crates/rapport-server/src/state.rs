//! Shared server state.

use crate::config::Config;
use anyhow::{Context, Result};
use rapport_core::{
    ConversationLog, MatchResolver, PresenceHub, ReadTracker, RealtimeBus, SqliteStore,
    TypingSignal,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Services shared by every connection.
pub struct AppState {
    pub resolver: MatchResolver<SqliteStore>,
    pub log: ConversationLog<SqliteStore>,
    pub tracker: ReadTracker<SqliteStore>,
    pub presence: PresenceHub,
    pub typing: TypingSignal,
    pub bus: RealtimeBus,
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Open the configured store and start the services.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        let store = if config.storage.path == ":memory:" {
            SqliteStore::open_in_memory()
        } else {
            SqliteStore::open(&config.storage.path)
        }
        .with_context(|| format!("Failed to open database {}", config.storage.path))?;

        Self::with_store(config, Arc::new(store)).await
    }

    /// Start the services over an existing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation log cannot read the end of the log.
    pub async fn with_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
        let bus = RealtimeBus::new(config.bus());
        let publisher = bus.publisher();

        let log = ConversationLog::start(Arc::clone(&store), publisher.clone(), config.conversation())
            .await
            .context("Failed to start conversation log")?;

        info!(storage = %config.storage.path, "Services started");

        Ok(Self {
            resolver: MatchResolver::new(Arc::clone(&store), publisher.clone()),
            log,
            tracker: ReadTracker::new(store, publisher.clone()),
            presence: PresenceHub::new(publisher.clone(), config.presence()),
            typing: TypingSignal::new(publisher, &config.typing()),
            bus,
            config,
            connections: AtomicUsize::new(0),
        })
    }

    /// Reserve a connection slot.
    ///
    /// Returns `None` once `max_connections` are open; the slot is released
    /// when the returned guard drops.
    pub fn try_connect(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < max).then_some(open + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Spawn the presence reaper and the typing throttle sweep.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let typing = self.typing.clone();
        let sweep_every = Duration::from_millis(self.config.typing.sweep_interval_ms.max(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                typing.sweep();
            }
        });

        vec![self.presence.spawn_reaper(), sweeper]
    }
}

/// A reserved connection slot.
pub struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) async fn test_state(config: Config) -> Arc<AppState> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    Arc::new(AppState::with_store(config, store).await.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 2;
        let state = test_state(config).await;

        let first = state.try_connect().unwrap();
        let _second = state.try_connect().unwrap();
        assert!(state.try_connect().is_none());
        assert_eq!(state.connection_count(), 2);

        drop(first);
        assert_eq!(state.connection_count(), 1);
        assert!(state.try_connect().is_some());
    }
}
