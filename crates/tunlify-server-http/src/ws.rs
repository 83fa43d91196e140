//! Client channel endpoint
//!
//! One JSON text frame per protocol message. The connection token travels in
//! the `token` query parameter.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunlify_control::{Outbound, RelayError, TeardownReason};
use tunlify_proto::{encode, TunnelMessage, MAX_MESSAGE_SIZE};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub token: Option<String>,
}

/// GET /ws/tunnel?token=... - upgrade to a client channel
pub async fn tunnel_channel(
    ws: WebSocketUpgrade,
    Query(params): Query<ChannelParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_channel(socket, state, params.token))
}

async fn serve_channel(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut ws_tx, ws_rx) = socket.split();

    let (tunnel, mut outbound) = match state.handler.open(token.as_deref()).await {
        Ok(opened) => opened,
        Err(e) => {
            let frame = CloseFrame {
                code: e.close_code(),
                reason: e.to_string().into(),
            };
            let _ = ws_tx.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let session = tunnel.session;
    info!(
        tunnel = %session.key(),
        session_id = session.id(),
        url = %tunnel.tunnel.url,
        "Client channel open"
    );

    // Writer: drains the session's outbound queue onto the socket
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Message(message) => {
                    let text = match encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(
                                tunnel = %writer_session.key(),
                                "Dropping unencodable {} message: {}",
                                message.kind(),
                                e
                            );
                            if let TunnelMessage::Request { id, .. } = message {
                                writer_session
                                    .pending()
                                    .resolve(id, Err(RelayError::TransportError(e.to_string())));
                            }
                            continue;
                        }
                    };

                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(tunnel = %writer_session.key(), "Failed to write to client: {}", e);
                        writer_session.teardown(TeardownReason::TransportError);
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        debug!(tunnel = %writer_session.key(), "Client writer ended");
    });

    // Reader: text frames until the client closes
    let inbound = ws_rx
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Ignoring non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let reason = state.handler.run(session, Box::pin(inbound)).await;
    debug!(?reason, "Client channel finished");

    let _ = writer.await;
}
