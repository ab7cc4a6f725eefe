//! Per-connection session.
//!
//! A session turns decoded client frames into calls on the shared services
//! and turns bus deliveries into outbound frames. It knows nothing about the
//! socket, so it can be driven directly in tests.

use crate::metrics;
use crate::state::AppState;
use rapport_core::model::now;
use rapport_core::{
    ConnectionId, CoreError, Delivery, LikeOutcome, Match, MatchId, Scope, SubscriptionHandle,
    UserId,
};
use rapport_protocol::{ErrorCode, Frame, InboxEntry, Version, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// One client connection.
pub struct Session {
    state: Arc<AppState>,
    connection_id: ConnectionId,
    user: Option<UserId>,
    handles: HashMap<Scope, SubscriptionHandle>,
    sink: mpsc::UnboundedSender<Delivery>,
}

impl Session {
    /// Create a session; deliveries for its subscriptions arrive on the
    /// returned receiver.
    pub fn new(
        state: Arc<AppState>,
        connection_id: impl Into<ConnectionId>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sink, deliveries) = mpsc::unbounded_channel();
        let session = Self {
            state,
            connection_id: connection_id.into(),
            user: None,
            handles: HashMap::new(),
            sink,
        };
        (session, deliveries)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The authenticated user, once connected.
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// Handle one client frame, returning the reply if there is one.
    pub async fn handle(&mut self, frame: Frame) -> Option<Frame> {
        let frame_type = frame.frame_type();
        if !frame_type.is_client() {
            warn!(connection = %self.connection_id, frame_type = ?frame_type, "Server frame from client");
            return Some(error_frame(frame.request_id().unwrap_or(0), ErrorCode::UnexpectedFrame));
        }

        let frame = match frame {
            Frame::Connect { version, user_id } => return Some(self.connect(version, user_id)),
            other => other,
        };

        let Some(user) = self.user.clone() else {
            return Some(error_frame(frame.request_id().unwrap_or(0), ErrorCode::HandshakeRequired));
        };

        // Any traffic keeps the user online, not just pings.
        self.state.presence.heartbeat(&user, &self.connection_id);

        match frame {
            Frame::Subscribe { id, scope } => Some(self.subscribe(id, &user, scope).await),
            Frame::Unsubscribe { id, scope } => Some(self.unsubscribe(id, &scope).await),
            Frame::Like { id, target } => Some(self.like(id, &user, &target).await),
            Frame::Accept { id, from } => Some(self.accept(id, &user, &from).await),
            Frame::Reject { id, from } => Some(self.reply(
                id,
                self.state.resolver.reject_pending(&user, &from).await.map(|_| Frame::ack(id)),
            )),
            Frame::Withdraw { id, target } => Some(self.reply(
                id,
                self.state.resolver.withdraw_like(&user, &target).await.map(|_| Frame::ack(id)),
            )),
            Frame::Send {
                id,
                match_id,
                body,
                client_key,
            } => {
                let result = self
                    .state
                    .log
                    .append(&match_id, &user, &body, client_key.as_deref())
                    .await
                    .map(|message| {
                        metrics::record_message_appended();
                        Frame::Sent { id, message }
                    });
                Some(self.reply(id, result))
            }
            Frame::History {
                id,
                match_id,
                since,
                limit,
            } => Some(self.history(id, &user, match_id, since, limit).await),
            Frame::MarkRead { id, match_id, at } => {
                let result = self
                    .state
                    .tracker
                    .mark_read(&user, &match_id, at.unwrap_or_else(now))
                    .await
                    .map(|_| Frame::ack(id));
                Some(self.reply(id, result))
            }
            Frame::Typing { match_id } => {
                self.typing(&user, match_id).await;
                None
            }
            Frame::Sync { id } => Some(self.sync(id, &user).await),
            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),
            other => {
                warn!(connection = %self.connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
                Some(error_frame(other.request_id().unwrap_or(0), ErrorCode::UnexpectedFrame))
            }
        }
    }

    /// Turn a bus delivery into the frame pushed to the client.
    pub fn delivery_frame(&self, delivery: Delivery) -> Frame {
        match delivery {
            Delivery::Event(event) => Frame::event((*event).clone()),
            Delivery::Lagged { scope, missed } => {
                metrics::record_dropped(missed);
                Frame::Resync { scope, missed }
            }
        }
    }

    /// Release every subscription and the presence of this connection.
    pub async fn close(mut self) {
        for (_, handle) in self.handles.drain() {
            handle.cancel().await;
        }
        self.state.bus.unsubscribe_all(&self.connection_id);
        if let Some(user) = self.user.take() {
            self.state.presence.leave(&user, &self.connection_id);
        }
        metrics::set_active_scopes(self.state.bus.stats().scope_count);
        debug!(connection = %self.connection_id, "Session closed");
    }

    fn connect(&mut self, version: Version, user_id: UserId) -> Frame {
        if self.user.is_some() {
            warn!(connection = %self.connection_id, "Repeated handshake");
            return error_frame(0, ErrorCode::UnexpectedFrame);
        }

        let negotiated = match PROTOCOL_VERSION.negotiate(version) {
            Ok(v) => v,
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "Handshake refused");
                return error_frame(0, ErrorCode::from(&e));
            }
        };

        if user_id.is_empty() {
            return error_frame(0, ErrorCode::InvalidInput);
        }

        // Own scopes are implicit.
        for scope in [
            Scope::Likes(user_id.clone()),
            Scope::Matches(user_id.clone()),
            Scope::ReadState(user_id.clone()),
        ] {
            if let Err(code) = self.attach(scope) {
                self.release_all();
                return error_frame(0, code);
            }
        }

        self.state.presence.join(&user_id, &self.connection_id);
        debug!(connection = %self.connection_id, user = %user_id, version = %negotiated, "Session connected");
        self.user = Some(user_id);

        let heartbeat = u32::try_from(self.state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
        Frame::Connected {
            connection_id: self.connection_id.clone(),
            version: negotiated,
            heartbeat,
        }
    }

    async fn subscribe(&mut self, id: u64, user: &UserId, scope: Scope) -> Frame {
        if let Err(code) = self.authorize(user, &scope).await {
            debug!(connection = %self.connection_id, scope = %scope, code = ?code, "Subscribe refused");
            return error_frame(id, code);
        }

        match self.attach(scope) {
            Ok(()) => Frame::ack(id),
            Err(code) => error_frame(id, code),
        }
    }

    async fn unsubscribe(&mut self, id: u64, scope: &Scope) -> Frame {
        match self.handles.remove(scope) {
            Some(handle) => {
                handle.cancel().await;
                metrics::set_active_scopes(self.state.bus.stats().scope_count);
                Frame::ack(id)
            }
            None => error_frame(id, ErrorCode::NotSubscribed),
        }
    }

    /// Whether `user` may watch `scope`.
    async fn authorize(&self, user: &UserId, scope: &Scope) -> Result<(), ErrorCode> {
        match scope {
            Scope::Likes(owner) | Scope::Matches(owner) | Scope::ReadState(owner) => {
                if owner == user {
                    Ok(())
                } else {
                    Err(ErrorCode::ScopeForbidden)
                }
            }
            Scope::Conversation(match_id) | Scope::Typing(match_id) => {
                match self.participant_match(user, *match_id).await {
                    Ok(_) => Ok(()),
                    Err(CoreError::NotParticipant { .. }) => Err(ErrorCode::ScopeForbidden),
                    Err(e) => Err(self.log_error(&e)),
                }
            }
            Scope::Presence(target) => {
                if target == user {
                    return Err(ErrorCode::ScopeForbidden);
                }
                match self.state.resolver.match_exists(user, target).await {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(ErrorCode::ScopeForbidden),
                    Err(e) => Err(self.log_error(&e)),
                }
            }
        }
    }

    fn attach(&mut self, scope: Scope) -> Result<(), ErrorCode> {
        let handle = self
            .state
            .bus
            .attach(&self.connection_id, scope.clone(), self.sink.clone())
            .map_err(|e| {
                warn!(connection = %self.connection_id, error = %e, "Subscribe failed");
                ErrorCode::from(&e)
            })?;
        self.handles.insert(scope, handle);
        metrics::set_active_scopes(self.state.bus.stats().scope_count);
        Ok(())
    }

    fn release_all(&mut self) {
        // Dropping a handle unsubscribes it.
        self.handles.clear();
    }

    async fn like(&self, id: u64, user: &UserId, target: &UserId) -> Frame {
        let result = self.state.resolver.record_like(user, target).await.map(|outcome| {
            let created = matches!(outcome, LikeOutcome::Matched { created: true, .. });
            if created {
                metrics::record_match_created();
            }
            Frame::LikeResult {
                id,
                matched: outcome.matched().cloned(),
                created,
            }
        });
        self.reply(id, result)
    }

    async fn accept(&self, id: u64, user: &UserId, from: &UserId) -> Frame {
        let result = self
            .state
            .resolver
            .accept_pending(user, from)
            .await
            .map(|resolution| {
                if resolution.created {
                    metrics::record_match_created();
                }
                Frame::LikeResult {
                    id,
                    matched: Some(resolution.matched),
                    created: resolution.created,
                }
            });
        self.reply(id, result)
    }

    async fn history(
        &self,
        id: u64,
        user: &UserId,
        match_id: MatchId,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: u32,
    ) -> Frame {
        if let Err(e) = self.participant_match(user, match_id).await {
            return self.reply(id, Err(e));
        }

        let limit = (limit as usize).clamp(1, self.state.config.limits.max_page_size.max(1));
        let result = self
            .state
            .log
            .history(&match_id, since, limit)
            .await
            .map(|messages| Frame::HistoryPage {
                id,
                match_id,
                // A full page may be followed by more.
                more: messages.len() == limit,
                messages,
            });
        self.reply(id, result)
    }

    /// Typing failures are never reported back.
    async fn typing(&self, user: &UserId, match_id: MatchId) {
        match self.participant_match(user, match_id).await {
            Ok(_) => {
                self.state.typing.notify_typing(match_id, user);
            }
            Err(e) => {
                debug!(connection = %self.connection_id, error = %e, "Typing ping dropped");
            }
        }
    }

    async fn sync(&self, id: u64, user: &UserId) -> Frame {
        let resolver = &self.state.resolver;
        let result = async {
            let matches = resolver.matches_for(user).await?;
            let incoming = resolver.pending_incoming(user).await?;
            let outgoing = resolver.pending_outgoing(user).await?;
            let inbox = self
                .state
                .tracker
                .inbox(user)
                .await?
                .into_iter()
                .map(|preview| InboxEntry {
                    matched: preview.matched,
                    last_message: preview.last_message,
                    unread: preview.unread,
                })
                .collect();
            let online = matches
                .iter()
                .filter_map(|m| m.other(user))
                .filter(|other| self.state.presence.is_online(other))
                .cloned()
                .collect();

            Ok::<_, CoreError>(Frame::SyncState {
                id,
                matches,
                incoming,
                outgoing,
                inbox,
                online,
            })
        }
        .await;
        self.reply(id, result)
    }

    async fn participant_match(&self, user: &UserId, match_id: MatchId) -> Result<Match, CoreError> {
        let matched = self.state.resolver.get(&match_id).await?;
        if !matched.involves(user) {
            return Err(CoreError::NotParticipant {
                user: user.clone(),
                match_id,
            });
        }
        Ok(matched)
    }

    fn reply(&self, id: u64, result: Result<Frame, CoreError>) -> Frame {
        match result {
            Ok(frame) => frame,
            Err(e) => error_frame(id, self.log_error(&e)),
        }
    }

    fn log_error(&self, err: &CoreError) -> ErrorCode {
        let code = ErrorCode::from(err);
        if matches!(err, CoreError::Storage(_)) {
            error!(connection = %self.connection_id, error = %err, "Storage failure");
            metrics::record_error("storage");
        } else {
            debug!(connection = %self.connection_id, error = %err, "Request rejected");
            metrics::record_error("request");
        }
        code
    }
}

/// An error frame carrying the code and its user-facing message.
pub fn error_frame(id: u64, code: ErrorCode) -> Frame {
    Frame::error(id, code.code(), code.user_message())
}
