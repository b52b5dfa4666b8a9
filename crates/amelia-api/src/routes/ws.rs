//! `GET /ws/events` (spec.md §6.2): JSON-over-WebSocket event stream with
//! per-workflow subscribe/unsubscribe, reconnect backfill, and an idle
//! timeout measured from the last client frame.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use amelia_contracts::event::Event;
use amelia_orchestrator::EventBus;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/events", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { workflow_id: Uuid, since_sequence: Option<i64> },
    Unsubscribe { workflow_id: Uuid },
    SubscribeAll,
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    Event { payload: &'a Event },
    BackfillComplete { count: usize },
    Ping,
    Error { error: &'static str, message: String },
}

/// Forwards a per-workflow (or firehose) broadcast subscription into the
/// socket's single outbound channel until cancelled. A lagging subscriber
/// doesn't lose events silently (spec.md §4.4): it gets a `SYSTEM_WARNING`
/// on the same channel it lagged on, then keeps forwarding.
fn spawn_forwarder(
    mut receiver: tokio::sync::broadcast::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    cancellation: CancellationToken,
    event_bus: EventBus,
    lag_workflow_id: Uuid,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                event = receiver.recv() => match event {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        event_bus.publish_lag_warning(lag_workflow_id, skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    });
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut client_frames) = socket.split();
    let idle_timeout = Duration::from_secs(state.config.websocket_idle_timeout_seconds);
    // Ping at a third of the idle timeout so an otherwise-healthy, quiet
    // connection gets at least two chances to answer before it's dropped.
    let mut ping_ticker = tokio::time::interval(idle_timeout / 3);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_ticker.tick().await; // first tick fires immediately

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
    let mut workflow_subs: HashMap<Uuid, CancellationToken> = HashMap::new();
    let mut all_sub: Option<CancellationToken> = None;

    'outer: loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                if send_json(&mut sender, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            }
            frame = tokio::time::timeout(idle_timeout, client_frames.next()) => {
                let frame = match frame {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(Some(Err(_))) | Ok(None) => break,
                    Err(_) => break, // idle timeout elapsed with no client frame
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = send_json(&mut sender, &ServerMessage::Error {
                            error: "Validation",
                            message: format!("malformed client frame: {e}"),
                        }).await;
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::Subscribe { workflow_id, since_sequence } => {
                        let backlog = match state.store.list_events(workflow_id, since_sequence).await {
                            Ok(events) => events,
                            Err(e) => {
                                let _ = send_json(&mut sender, &ServerMessage::Error {
                                    error: e.kind(),
                                    message: e.to_string(),
                                }).await;
                                continue;
                            }
                        };
                        let count = backlog.len();
                        for event in &backlog {
                            if send_json(&mut sender, &ServerMessage::Event { payload: event }).await.is_err() {
                                break 'outer;
                            }
                        }
                        if send_json(&mut sender, &ServerMessage::BackfillComplete { count }).await.is_err() {
                            break 'outer;
                        }
                        if let Some(old) = workflow_subs.remove(&workflow_id) {
                            old.cancel();
                        }
                        let cancellation = CancellationToken::new();
                        spawn_forwarder(
                            state.event_bus.subscribe(workflow_id),
                            event_tx.clone(),
                            cancellation.clone(),
                            state.event_bus.clone(),
                            workflow_id,
                        );
                        workflow_subs.insert(workflow_id, cancellation);
                    }
                    ClientMessage::Unsubscribe { workflow_id } => {
                        if let Some(token) = workflow_subs.remove(&workflow_id) {
                            token.cancel();
                        }
                    }
                    ClientMessage::SubscribeAll => {
                        if let Some(old) = all_sub.take() {
                            old.cancel();
                        }
                        let cancellation = CancellationToken::new();
                        spawn_forwarder(
                            state.event_bus.subscribe_all(),
                            event_tx.clone(),
                            cancellation.clone(),
                            state.event_bus.clone(),
                            Uuid::nil(),
                        );
                        all_sub = Some(cancellation);
                    }
                    ClientMessage::Pong => {}
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { continue };
                if send_json(&mut sender, &ServerMessage::Event { payload: &event }).await.is_err() {
                    break;
                }
            }
        }
    }

    for token in workflow_subs.into_values() {
        token.cancel();
    }
    if let Some(token) = all_sub {
        token.cancel();
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage<'_>,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".into());
    sender.send(Message::Text(text)).await
}
