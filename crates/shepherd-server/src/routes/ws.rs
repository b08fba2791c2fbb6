//! Event-stream WebSocket: replay plus live fan-out from the `EventHub`
//! (§4.3.4 GET, §6.4).

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use shepherd_core::HubMessage;
use tracing::{instrument, warn};

use crate::state::ServerState;

/// Normal closure once the hub marks the task done and the `task_complete`
/// frame has been sent.
const CLOSE_NORMAL: u16 = 1000;
/// Policy-violation closure for a subscriber evicted for falling behind;
/// no `task_complete` frame precedes it (§8, testable property 6).
const CLOSE_SLOW_CONSUMER: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    pub after: u64,
}

#[instrument(skip(state, upgrade), fields(task_id = %id))]
pub async fn event_stream(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<EventStreamQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state, id, query.after))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState, task_id: String, after: u64) {
    let subscription = state.events.subscribe(&task_id, after);

    for event in &subscription.replay {
        let Ok(text) = serde_json::to_string(&serde_json::json!({
            "type": "task_event",
            "data": event,
        })) else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let Some(mut receiver) = subscription.receiver else {
        // The task was already done when we subscribed: nothing live to
        // wait for, and there's no in-flight Complete message to relay.
        close_normal(socket).await;
        return;
    };

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream socket error");
                        break;
                    }
                    // Clients don't send meaningful frames on this stream.
                    Some(Ok(_)) => continue,
                }
            }

            message = receiver.recv() => {
                match message {
                    Some(HubMessage::Event(event)) => {
                        let Ok(text) = serde_json::to_string(&serde_json::json!({
                            "type": "task_event",
                            "data": event,
                        })) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(HubMessage::Complete(outcome)) => {
                        if let Ok(text) = serde_json::to_string(&serde_json::json!({
                            "type": "task_complete",
                            "data": outcome,
                        })) {
                            let _ = socket.send(Message::Text(text.into())).await;
                        }
                        close_normal(socket).await;
                        return;
                    }
                    None => {
                        // Channel closed without a Complete message: this
                        // subscriber was evicted for being too slow.
                        close_slow_consumer(socket).await;
                        return;
                    }
                }
            }
        }
    }

    state.events.unsubscribe(&task_id, subscription.id);
    close_normal(socket).await;
}

async fn close_normal(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "stream complete".into(),
        })))
        .await;
}

async fn close_slow_consumer(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_SLOW_CONSUMER,
            reason: "consumer fell behind".into(),
        })))
        .await;
}
