use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::call::CallCoordinator;
use crate::registry::SessionId;
use crate::signaling::{decode_client_message, ServerMessage};

/// Shared state of the signaling endpoint.
#[derive(Clone)]
pub struct SignalingState {
    coordinator: CallCoordinator,
}

impl SignalingState {
    pub fn new(coordinator: CallCoordinator) -> Self {
        Self { coordinator }
    }
}

/// What an inbound frame means for the signaling loop.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Payload(String),
    Close,
    Ignore,
}

fn classify(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Payload(text),
        // Some clients send JSON in binary frames
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => Frame::Payload(text),
            Err(_) => Frame::Ignore,
        },
        Message::Close(_) => Frame::Close,
        Message::Ping(_) | Message::Pong(_) => Frame::Ignore,
    }
}

/// WebSocket upgrade handler for `/one2one`.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: SignalingState, remote_addr: SocketAddr) {
    let session_id = SessionId::generate();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "failed to encode outbound message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(session_id = %session_id, "writer task finished");
    });

    info!(session_id = %session_id, remote_addr = %remote_addr, "signaling connection opened");

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "signaling transport error");
                break;
            }
        };

        match classify(message) {
            Frame::Payload(text) => match decode_client_message(&text) {
                Ok(message) => state.coordinator.dispatch(session_id, tx.clone(), message),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "rejecting malformed message");
                    counter!("beach_call_malformed_messages_total").increment(1);
                    let _ = tx.send(err.into_reply());
                }
            },
            Frame::Close => {
                debug!(session_id = %session_id, "close frame received");
                break;
            }
            Frame::Ignore => {}
        }
    }

    state.coordinator.disconnect(session_id);
    writer.abort();

    info!(session_id = %session_id, remote_addr = %remote_addr, "signaling connection closed");
}
