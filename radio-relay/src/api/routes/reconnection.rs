//! Reconnection status streams, per broadcast and global.

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::api::server::AppState;
use crate::domain::BroadcastId;
use crate::reconnection::{Topic, TopicSubscription};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/broadcasts/status", get(global_ws))
        .route("/broadcasts/{broadcast_id}/reconnection", get(broadcast_ws))
}

async fn global_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let subscription = state.services.reconnection.subscribe_topic(Topic::Global);
    ws.on_upgrade(move |socket| stream_events(socket, subscription))
}

async fn broadcast_ws(
    ws: WebSocketUpgrade,
    Path(broadcast_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let topic = Topic::Broadcast(BroadcastId::from(broadcast_id));
    let subscription = state.services.reconnection.subscribe_topic(topic);
    ws.on_upgrade(move |socket| stream_events(socket, subscription))
}

/// Forward matching events until the client leaves or the coordinator stops.
async fn stream_events(socket: WebSocket, mut subscription: TopicSubscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "Failed to serialize reconnection event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    debug!(topic = ?subscription.topic(), "Reconnection subscriber left");
}
