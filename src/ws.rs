//! Realtime socket. The credential is checked before the upgrade; a socket
//! that gets through is registered and listens on its user's personal
//! address straight away.

use crate::auth::token_from_headers;
use crate::channels::{ConnectionId, ServerEvent};
use crate::error::{AppError, AppResult};
use crate::models::{Target, UserId};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Leave {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Typing {
        #[serde(rename = "receiverId")]
        receiver_id: Option<String>,
        #[serde(rename = "roomId")]
        room_id: Option<String>,
    },
}

/// Identify the user behind a socket handshake: `?token=` first, then the
/// bearer header or `jwt` cookie.
pub fn authenticate_handshake(
    state: &AppState,
    params: &WsParams,
    headers: &HeaderMap,
) -> AppResult<UserId> {
    let token = params
        .token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .or_else(|| token_from_headers(headers))
        .ok_or_else(|| AppError::Unauthorized("Missing credentials".to_string()))?;
    state.auth.authenticate(&token)
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = authenticate_handshake(&state, &params, &headers).inspect_err(|e| {
        warn!("Refused socket handshake: {}", e);
    })?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let channels = Arc::clone(state.fanout.channels());
    let handle = channels.connect(&user_id).await;
    let connection_id = handle.id;
    let mut events = handle.events;
    info!("{} connected ({})", user_id, connection_id);

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_frame(&state, connection_id, &user_id, &text).await;
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    channels.disconnect(connection_id).await;
    info!("{} disconnected ({})", user_id, connection_id);
}

/// Act on one client frame. Refusals are reported to this connection only.
pub(crate) async fn handle_frame(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: &str,
    text: &str,
) {
    let result = match serde_json::from_str::<ClientFrame>(text) {
        Err(e) => Err(AppError::Validation(format!("Unrecognized frame: {}", e))),
        Ok(ClientFrame::Join { room_id }) => {
            state
                .fanout
                .join_room(connection_id, user_id, &room_id)
                .await
        }
        Ok(ClientFrame::Leave { room_id }) => {
            state.fanout.leave_room(connection_id, &room_id).await;
            Ok(())
        }
        Ok(ClientFrame::Typing {
            receiver_id,
            room_id,
        }) => match Target::from_fields(receiver_id, room_id) {
            Ok(target) => state.fanout.typing(user_id, &target).await.map(|_| ()),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        debug!("Frame from {} refused: {}", user_id, e);
        let event = ServerEvent::Error {
            message: e.user_message(),
        };
        state.fanout.channels().send_to(connection_id, &event).await;
    }
}
