//! `/ws` streaming protocol (`spec.md` §6): clients subscribe/unsubscribe
//! to a work order's event stream; the server replays a catch-up window
//! from the [`EventBuffer`](crate::events::buffer::EventBuffer) on
//! subscribe, then forwards live events through the rate limiter.

use super::AppState;
use crate::events::{StreamEvent, StreamEventPayload};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { work_order_id: String },
    Unsubscribe { work_order_id: String },
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut drain_ticker = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = drain_ticker.tick() => {
                let drained = state.rate_limiter.drain_tick().await;
                for event in drained {
                    if subscriptions.contains(&event.work_order_id) {
                        if send_event(&mut socket, &event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { return };
                match msg {
                    Message::Text(text) => {
                        let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                            let _ = send_payload(&mut socket, "", StreamEventPayload::Error {
                                code: "BAD_MESSAGE".to_string(),
                                message: "could not parse client message".to_string(),
                            }).await;
                            continue;
                        };
                        match client_msg {
                            ClientMessage::Subscribe { work_order_id } => {
                                subscriptions.insert(work_order_id.clone());
                                let catchup = state
                                    .event_buffer
                                    .get_latest(&work_order_id, state.config.stream_catchup_events)
                                    .await;
                                for event in catchup {
                                    if send_event(&mut socket, &event).await.is_err() {
                                        return;
                                    }
                                }
                                if send_payload(&mut socket, &work_order_id, StreamEventPayload::SubscriptionConfirmed {
                                    work_order_id: work_order_id.clone(),
                                }).await.is_err() {
                                    return;
                                }
                            }
                            ClientMessage::Unsubscribe { work_order_id } => {
                                subscriptions.remove(&work_order_id);
                                if send_payload(&mut socket, &work_order_id, StreamEventPayload::UnsubscriptionConfirmed {
                                    work_order_id: work_order_id.clone(),
                                }).await.is_err() {
                                    return;
                                }
                            }
                            ClientMessage::Ping => {
                                if send_payload(&mut socket, "", StreamEventPayload::Pong).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text)).await
}

async fn send_payload(socket: &mut WebSocket, work_order_id: &str, payload: StreamEventPayload) -> Result<(), axum::Error> {
    let event = StreamEvent::new(work_order_id, payload);
    send_event(socket, &event).await
}
