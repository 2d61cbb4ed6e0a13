//! Listener status stream.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::api::auth::extract_token;
use crate::api::server::AppState;
use crate::fanout::{ListenerIdentity, StatusChannel};
use crate::{Error, Result};

#[derive(Debug, Default, Deserialize)]
pub struct ListenerParams {
    pub token: Option<String>,
}

/// A message a listener client may send.
#[derive(Debug, Deserialize)]
pub struct ListenerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub action: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/listener", get(listener_ws))
}

async fn listener_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ListenerParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = state.jwt_service.as_ref().and_then(|jwt| {
        let token = extract_token(&headers, params.token.as_deref());
        jwt.resolve_listener(token.as_deref())
    });

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Option<ListenerIdentity>) {
    let fanout = state.services.fanout.clone();
    let (sink, mut receiver) = socket.split();
    let connection = fanout.register(Box::new(WsStatusChannel::new(sink)), identity);
    let id = connection.id;

    let initial = fanout.snapshot().await;
    let delivered = match serde_json::to_string(&initial) {
        Ok(text) => connection.send_text(text).await.is_ok(),
        Err(e) => {
            debug!(error = %e, "Failed to serialize initial snapshot");
            false
        }
    };

    if delivered {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ListenerMessage>(&text) {
                    Ok(message) => debug!(
                        connection = %id,
                        kind = %message.kind,
                        action = message.action.as_deref().unwrap_or("-"),
                        user = connection.identity.as_ref().map(|i| i.user_id.as_str()).unwrap_or("anonymous"),
                        "Listener message"
                    ),
                    Err(e) => trace!(connection = %id, error = %e, "Ignoring malformed listener message"),
                },
                Ok(Message::Ping(payload)) => {
                    if connection.send_pong(payload).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    fanout.unregister(&id);
}

/// [`StatusChannel`] over the write half of an axum WebSocket.
pub struct WsStatusChannel {
    sink: SplitSink<WebSocket, Message>,
    open: bool,
}

impl WsStatusChannel {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink, open: true }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        if let Err(e) = self.sink.send(message).await {
            self.open = false;
            return Err(Error::Other(format!("WebSocket send failed: {}", e)));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusChannel for WsStatusChannel {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    async fn send_pong(&mut self, payload: Bytes) -> Result<()> {
        self.send(Message::Pong(payload)).await
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
