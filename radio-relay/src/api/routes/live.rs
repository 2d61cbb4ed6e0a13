//! Broadcaster audio ingest over WebSocket.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tracing::{debug, info, warn};

use crate::api::server::AppState;
use crate::domain::BroadcastId;
use crate::relay::{InboundChannel, InboundFrame};

pub fn router() -> Router<AppState> {
    Router::new().route("/live/{broadcast_id}", get(live_ingest_ws))
}

/// Accept a broadcaster and relay its binary frames until either side ends.
async fn live_ingest_ws(
    ws: WebSocketUpgrade,
    Path(broadcast_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let broadcast_id = BroadcastId::from(broadcast_id);
    ws.on_upgrade(move |socket| async move {
        let mut channel = WsInbound::new(socket);
        match state.services.relays.run(broadcast_id.clone(), &mut channel).await {
            Ok(report) => info!(
                %broadcast_id,
                bytes = report.bytes_relayed,
                end = %report.end.describe(),
                "Broadcaster session finished"
            ),
            Err(e) => warn!(%broadcast_id, error = %e, "Broadcaster session rejected"),
        }
    })
}

/// [`InboundChannel`] over an axum WebSocket.
pub struct WsInbound {
    socket: WebSocket,
}

impl WsInbound {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl InboundChannel for WsInbound {
    async fn recv(&mut self) -> InboundFrame {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Binary(data))) => return InboundFrame::Audio(data),
                Some(Ok(Message::Close(_))) | None => return InboundFrame::Closed,
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(text))) => {
                    debug!(len = text.len(), "Ignoring text frame on audio channel");
                }
                Some(Err(e)) => return InboundFrame::Error(e.to_string()),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame not delivered");
        }
    }
}
