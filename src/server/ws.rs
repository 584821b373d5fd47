//! WebSocket streaming of bus topics.
//!
//! One `/ws` connection can watch any number of topics; the client drives
//! the subscription table with `{"op":"subscribe","topic":"portal.9.log"}` /
//! `{"op":"unsubscribe",...}` frames. The socket owns its bus handles, so a
//! closing connection unsubscribes everything it watched — which is exactly
//! the edge that stops log tailers when the last observer leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::message::{Message, SubscriberId};

use super::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, state).await;
}

/// Core socket loop: forwards bus messages out, applies client subscribe/
/// unsubscribe commands, and keeps the connection healthy with ping/pong.
/// On exit every topic this socket subscribed is unsubscribed, in arrival
/// order irrelevant — each drop is its own potential 1→0 edge.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, WsFrame>,
    mut receiver: SplitStream<WebSocket>,
    state: SharedState,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut subscriptions: HashMap<String, SubscriberId> = HashMap::new();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(WsFrame::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Bus forwarding ──────────────────────────────────────
            message = rx.recv() => {
                let Some(message) = message else { break };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if sender.send(WsFrame::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "failed to serialize bus message"),
                }
            }

            // ── Client frames ───────────────────────────────────────
            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(text.as_str()) {
                            Ok(ClientCommand::Subscribe { topic }) => {
                                subscriptions.entry(topic).or_insert_with_key(|topic| {
                                    state.bus.subscribe(topic, tx.clone())
                                });
                            }
                            Ok(ClientCommand::Unsubscribe { topic }) => {
                                if let Some(id) = subscriptions.remove(&topic) {
                                    state.bus.unsubscribe(&topic, id);
                                }
                            }
                            Err(e) => debug!(error = %e, "ignoring malformed client frame"),
                        }
                    }
                    Some(Ok(WsFrame::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for (topic, id) in subscriptions {
        state.bus.unsubscribe(&topic, id);
    }
    let _ = sender.send(WsFrame::Close(None)).await;
}
