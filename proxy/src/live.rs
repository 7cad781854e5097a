//! Live log transports: Server-Sent Events and WebSocket.
//!
//! Both register with the [`EventHub`] on connect and hold a
//! [`Subscription`] for the lifetime of the connection. When the
//! connection ends the subscription is dropped, which deregisters the
//! observer exactly once.
//!
//! ## Socket protocol
//!
//! Every frame is JSON `{"type": ..., "data": ...}`.
//!
//! | Direction | Type                     | Data                                 |
//! |-----------|--------------------------|--------------------------------------|
//! | server    | `CONNECTION_ESTABLISHED` | `{timestamp, message}`               |
//! | server    | `STATS_UPDATE`           | hub stats                            |
//! | server    | `LOGS_UPDATE`            | records, newest first                |
//! | server    | `NEW_LOG`                | one record                           |
//! | client    | `GET_LOGS`               | `limit?`, `filter?` (top-level)      |
//! | client    | `GET_STATS`              |                                      |
//! | client    | `GET_LOGS_BY_DATE`       | `startDate`, `endDate`, `filter?`    |

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use nvp_core::config::{SOCKET_DEFAULT_QUERY_LIMIT, SOCKET_INITIAL_LOGS, SSE_KEEPALIVE_INTERVAL};
use nvp_core::events::{EventHub, HubStats, LogRecord, ObserverKind, Order};

use crate::api::AppState;

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// `GET /logs/stream`: backlog first, then every new record as an
/// `event: log` frame. Keep-alive comments are never stored.
pub async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.hub.subscribe(ObserverKind::Stream);
    tracing::info!(observer = %subscription.id(), "stream observer connected");

    let events = stream::unfold(subscription, |mut sub| async move {
        let record = sub.next().await?;
        let event = Event::default()
            .event("log")
            .json_data(&record)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to encode log record");
                Event::default().comment("unencodable record skipped")
            });
        Some((Ok(event), sub))
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEPALIVE_INTERVAL)
            .text("ping"),
    )
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
        message: String,
    },
    StatsUpdate(HubStats),
    LogsUpdate(Vec<LogRecord>),
    NewLog(LogRecord),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    GetLogs {
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        filter: Option<String>,
    },
    GetStats,
    #[serde(rename_all = "camelCase")]
    GetLogsByDate {
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        #[serde(default)]
        filter: Option<String>,
    },
}

/// Point-to-point reply to a client query. Malformed or unknown messages
/// get no reply.
pub fn answer(hub: &EventHub, text: &str) -> Option<ServerMessage> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring socket message");
            return None;
        }
    };

    Some(match message {
        ClientMessage::GetLogs { limit, filter } => ServerMessage::LogsUpdate(hub.recent_of_type(
            limit.unwrap_or(SOCKET_DEFAULT_QUERY_LIMIT),
            filter.as_deref().filter(|f| !f.is_empty()),
            Order::NewestFirst,
        )),
        ClientMessage::GetStats => ServerMessage::StatsUpdate(hub.stats()),
        ClientMessage::GetLogsByDate {
            start_date,
            end_date,
            filter,
        } => ServerMessage::LogsUpdate(hub.between(
            start_date,
            end_date,
            filter.as_deref().filter(|f| !f.is_empty()),
        )),
    })
}

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let payload = serde_json::to_string(message).map_err(|e| {
        tracing::warn!(error = %e, "failed to encode socket message");
    })?;
    socket.send(Message::Text(payload)).await.map_err(|_| ())
}

/// Connect-time messages, in send order. `backlog` is the subscription's
/// own snapshot, so the first `NEW_LOG` is exactly the next record after it.
pub fn greeting(hub: &EventHub, backlog: Vec<LogRecord>) -> [ServerMessage; 3] {
    let initial = backlog.into_iter().rev().take(SOCKET_INITIAL_LOGS).collect();
    [
        ServerMessage::ConnectionEstablished {
            timestamp: Utc::now(),
            message: "Connected to NVP log stream".to_string(),
        },
        ServerMessage::StatsUpdate(hub.stats()),
        ServerMessage::LogsUpdate(initial),
    ]
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.hub.subscribe(ObserverKind::Socket);
    let observer = subscription.id();
    tracing::info!(%observer, "socket observer connected");

    let backlog = subscription.take_backlog();
    for message in &greeting(&state.hub, backlog) {
        if send(&mut socket, message).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            record = subscription.next() => {
                let Some(record) = record else {
                    tracing::debug!(%observer, "dropped by hub");
                    break;
                };
                if send(&mut socket, &ServerMessage::NewLog(record)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = answer(&state.hub, &text) {
                            if send(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(%observer, "socket observer disconnected");
}
