//! WebSocket endpoint streaming flow-control events to control clients.
//!
//! A client opts in by sending a `subscribe` message with topic patterns
//! (`*`, `upstream.*`, or exact names); matching `SystemEvent`s are then
//! forwarded as JSON. Right after the first subscribe the current upstream
//! state is pushed so the client never starts from an unknown state.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    /// Replaces the current topic list wholesale.
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    /// Application-level keep-alive.
    #[serde(rename = "ping")]
    Ping,
}

/// Upgrade handler for `/api/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut tx, mut rx) = socket.split();
    let mut events = state.events.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    // Nothing is forwarded before the first subscribe
    let mut topics: Vec<String> = vec![];
    let mut snapshot_sent = false;

    info!("control client connected");

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = apply_client_message(&text, &mut topics) {
                            warn!("ignoring malformed client message: {}", e);
                            continue;
                        }
                        if !snapshot_sent && !topics.is_empty() {
                            let snapshot = SystemEvent::UpstreamStateChanged {
                                state: state.upstream.state().as_i32(),
                            };
                            if forward(&mut tx, &snapshot).await.is_err() {
                                break;
                            }
                            snapshot_sent = true;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("control client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("websocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if subscribed(&event, &topics) && forward(&mut tx, &event).await.is_err() {
                            warn!("send to control client failed, closing session");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("control client lagged by {} events", n);
                        let notice = SystemEvent::Error {
                            message: format!("Lagged by {} events", n),
                        };
                        let _ = forward(&mut tx, &notice).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if tx.send(Message::Ping(vec![])).await.is_err() {
                    debug!("heartbeat failed, closing session");
                    break;
                }
            }
        }
    }
}

async fn forward(
    tx: &mut SplitSink<WebSocket, Message>,
    event: &SystemEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => tx.send(Message::Text(json)).await,
        // Serialization of our own enum cannot fail in practice; skip the event
        Err(e) => {
            warn!("event serialization failed: {}", e);
            Ok(())
        }
    }
}

fn apply_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    match serde_json::from_str(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            debug!("client subscribed to {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe { topics: removed } => {
            debug!("client unsubscribed from {:?}", removed);
            topics.retain(|t| !removed.contains(t));
        }
        ClientMessage::Ping => {}
    }
    Ok(())
}

fn subscribed(event: &SystemEvent, topics: &[String]) -> bool {
    if topics.is_empty() {
        return false;
    }
    if topics.iter().any(|t| t == "*") {
        return true;
    }
    topics.iter().any(|topic| event.matches_topic(topic))
}
