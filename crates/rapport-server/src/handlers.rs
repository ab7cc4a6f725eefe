//! Connection handlers for Rapport server.
//!
//! This module handles the connection lifecycle: the WebSocket upgrade, the
//! read/write loop around a [`Session`], and the HTTP health check.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::{error_frame, Session};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rapport_protocol::{codec, ErrorCode, Frame};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the listener cannot bind.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()).await?);
    let _maintenance = state.spawn_maintenance();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Rapport server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Rapport server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.bus.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "scopes": stats.scope_count,
        "subscriptions": stats.total_subscriptions,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.try_connect() else {
        warn!("Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            handle_websocket(socket, state).await;
        })
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut deliveries) = Session::new(Arc::clone(&state), connection_id.clone());

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = tokio::time::Instant::now() + idle_timeout;

    'conn: loop {
        tokio::select! {
            biased;

            // Events from subscribed scopes
            Some(delivery) = deliveries.recv() => {
                let frame = session.delivery_frame(delivery);
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let frame = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => frame,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Undecodable frame");
                                    metrics::record_error("decode");
                                    let _ = send_frame(&mut sender, &error_frame(0, ErrorCode::from(&e))).await;
                                    break 'conn;
                                }
                            };

                            let start = Instant::now();
                            metrics::record_frame(data.len(), "inbound");

                            if let Some(reply) = session.handle(frame).await {
                                if let Err(e) = send_frame(&mut sender, &reply).await {
                                    debug!(connection = %connection_id, error = %e, "Send failed");
                                    break 'conn;
                                }
                            }
                            metrics::record_latency(start.elapsed().as_secs_f64());
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!(connection = %connection_id, "Text message on binary protocol");
                        metrics::record_error("text_frame");
                        if send_frame(&mut sender, &error_frame(0, ErrorCode::InvalidFrame)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!(connection = %connection_id, "Heartbeat timeout");
                break;
            }
        }
    }

    debug!(connection = %session.connection_id(), user = ?session.user(), "WebSocket disconnected");
    session.close().await;
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
