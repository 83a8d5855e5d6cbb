use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use bookclub_common::{
    link::CloseKind,
    protocol::ws::{ClientFrame, ServerFrame, CURRENT_PROTOCOL_VERSION},
    types::{CursorPosition, UserIdentity},
};
use chrono::Utc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol as ws_protocol;
use super::session::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES};
use crate::auth::IdentityVerifier;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, SyncError,
};
use crate::metrics;
use crate::protocol;
use crate::rooms::{
    broadcast::{deliver, Delivery},
    RoomHub,
};

#[derive(Clone)]
pub struct WsState {
    pub hub: RoomHub,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// How long a fresh connection may wait before sending its hello.
    pub admission_timeout: Duration,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, socket)).await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

/// Only a normal closure (1000) is a deliberate leave. Going away (1001),
/// a missing status and every other code may be followed by a reconnect.
fn close_kind(frame: Option<&CloseFrame>) -> CloseKind {
    match frame {
        Some(frame) if frame.code == close_code::NORMAL => CloseKind::Graceful,
        _ => CloseKind::Abnormal,
    }
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

/// Sends the error frame and closes. Used for every admission failure.
async fn reject(socket: &mut WebSocket, error: SyncError, started_at: Instant) {
    metrics::record_ws_request("hello", true, started_at.elapsed().as_millis() as u64);
    debug!(error = %error, "connection rejected at admission");
    let _ = ws_protocol::send_frame(socket, &error.to_frame()).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: error.code().as_str().into(),
        })))
        .await;
}

/// Waits for the hello frame and validates it. Nothing is registered for
/// the connection until this returns an identity.
async fn admit(state: &WsState, socket: &mut WebSocket) -> Option<UserIdentity> {
    let started_at = Instant::now();
    let first = match timeout(state.admission_timeout, socket.recv()).await {
        Ok(first) => first,
        Err(_) => {
            reject(socket, SyncError::Admission("no hello before timeout".into()), started_at)
                .await;
            return None;
        }
    };

    let raw = match first {
        Some(Ok(Message::Text(raw))) => {
            if raw.len() > MAX_FRAME_BYTES {
                metrics::record_ws_request("hello", true, started_at.elapsed().as_millis() as u64);
                close_frame_too_large(socket).await;
                return None;
            }
            raw
        }
        Some(Err(error)) if is_frame_size_violation(&error) => {
            metrics::record_ws_request("hello", true, started_at.elapsed().as_millis() as u64);
            close_frame_too_large(socket).await;
            return None;
        }
        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
            metrics::record_ws_request("hello", true, started_at.elapsed().as_millis() as u64);
            return None;
        }
        Some(Ok(_)) => {
            reject(
                socket,
                SyncError::Admission("first frame must be a hello".into()),
                started_at,
            )
            .await;
            return None;
        }
    };

    let (token, protocol_version) = match ws_protocol::decode_frame(&raw) {
        Ok(ClientFrame::Hello { token, protocol_version }) => (token, protocol_version),
        _ => {
            reject(
                socket,
                SyncError::Admission("first frame must be a hello".into()),
                started_at,
            )
            .await;
            return None;
        }
    };

    if let Err(error) = protocol::require_supported(protocol_version.as_deref()) {
        reject(socket, error, started_at).await;
        return None;
    }

    match state.verifier.verify(&token) {
        Ok(identity) => {
            metrics::record_ws_request("hello", false, started_at.elapsed().as_millis() as u64);
            Some(identity)
        }
        Err(error) => {
            reject(socket, SyncError::Admission(error.to_string()), started_at).await;
            None
        }
    }
}

async fn handle_socket(state: WsState, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let Some(identity) = admit(&state, &mut socket).await else {
        return;
    };

    let hub = state.hub.clone();
    let (handle, mut outbound_receiver) = hub.open_session(identity.clone());
    let session_id = handle.session_id;
    let kicked = handle.kicked();
    hub.connect(handle.clone()).await;

    let hello_ack = ServerFrame::HelloAck {
        user: identity,
        server_time: Utc::now(),
        protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
    };
    if ws_protocol::send_frame(&mut socket, &hello_ack).await.is_err() {
        hub.disconnect(session_id, CloseKind::Abnormal).await;
        return;
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    let close = loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        session_id = %session_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break CloseKind::Abnormal;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break CloseKind::Abnormal;
                }
            }
            _ = kicked.notified() => {
                warn!(session_id = %session_id, "outbound queue overflowed, cycling session");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AGAIN,
                        reason: "outbound queue overflow".into(),
                    })))
                    .await;
                break CloseKind::Abnormal;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if ws_protocol::send_frame(&mut socket, &frame).await.is_err() {
                            break CloseKind::Abnormal;
                        }
                    }
                    None => break CloseKind::Abnormal,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break CloseKind::Abnormal;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        if raw.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break CloseKind::Abnormal;
                        }
                        hub.touch(session_id).await;

                        let inbound = match ws_protocol::decode_frame(&raw) {
                            Ok(frame) => frame,
                            Err(error) => {
                                metrics::increment_malformed_frames();
                                debug!(session_id = %session_id, error = %error, "ignoring malformed frame");
                                continue;
                            }
                        };

                        if matches!(inbound, ClientFrame::Leave) {
                            metrics::record_ws_request("leave", false, 0);
                            let _ = socket.send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "left".into(),
                            }))).await;
                            break CloseKind::Graceful;
                        }

                        let kind = inbound.kind();
                        let started_at = Instant::now();
                        let result = dispatch(&hub, session_id, inbound).await;
                        let elapsed_ms = started_at.elapsed().as_millis() as u64;
                        metrics::record_ws_request(kind, result.is_err(), elapsed_ms);

                        // Replies share the session queue so they stay ordered
                        // behind broadcasts already sent to this session.
                        let reply = match result {
                            Ok(reply) => reply,
                            Err(error) => {
                                debug!(session_id = %session_id, frame = kind, error = %error, "request failed");
                                Some(error.to_frame())
                            }
                        };
                        if let Some(reply) = reply {
                            deliver(&handle, reply, Delivery::Reliable);
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::increment_malformed_frames();
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break CloseKind::Abnormal;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        hub.touch(session_id).await;
                    }
                    Ok(Message::Close(frame)) => break close_kind(frame.as_ref()),
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break CloseKind::Abnormal;
                    }
                }
            }
        }
    };

    info!(session_id = %session_id, request_id = %request_id, close = ?close, "socket closed");
    hub.disconnect(session_id, close).await;
}

/// Runs one client request against the hub. Returns the frame to send back
/// to the requesting session, if any.
pub(crate) async fn dispatch(
    hub: &RoomHub,
    session_id: Uuid,
    frame: ClientFrame,
) -> Result<Option<ServerFrame>, SyncError> {
    match frame {
        ClientFrame::Hello { .. } => {
            Err(SyncError::Validation("connection is already admitted".into()))
        }
        ClientFrame::Join { club_id, room_id } => {
            let snapshot = hub.join(session_id, club_id, room_id).await?;
            Ok(Some(ServerFrame::Init(snapshot)))
        }
        ClientFrame::SwitchRoom { room_id } => {
            let snapshot = hub.switch_room(session_id, room_id).await?;
            Ok(Some(ServerFrame::RoomSwitched(snapshot)))
        }
        ClientFrame::ViewRoom { room_id } => {
            hub.view_room(session_id, room_id).await?;
            Ok(None)
        }
        ClientFrame::ViewSection { section, club_id } => {
            hub.view_section(session_id, &section, club_id).await?;
            Ok(None)
        }
        ClientFrame::ChatMessage { body, attachments, reply_to_id } => {
            hub.post_message(session_id, body, attachments, reply_to_id).await?;
            Ok(None)
        }
        ClientFrame::LoadOlderMessages { before, limit } => {
            Ok(Some(hub.load_older_messages(session_id, before, limit).await?))
        }
        ClientFrame::EditDocument { text, base_revision } => {
            Ok(Some(hub.apply_edit(session_id, text, base_revision).await?))
        }
        ClientFrame::CursorMove { line, column } => {
            hub.move_cursor(session_id, CursorPosition { line, column }).await?;
            Ok(None)
        }
        ClientFrame::React { message_id, emoji, action } => {
            hub.react(session_id, message_id, &emoji, action).await?;
            Ok(None)
        }
        ClientFrame::EditMessage { message_id, content } => {
            hub.edit_message(session_id, message_id, content).await?;
            Ok(None)
        }
        ClientFrame::DeleteMessage { message_id } => {
            hub.delete_message(session_id, message_id).await?;
            Ok(None)
        }
        ClientFrame::Leave => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::{close_code, CloseFrame};
    use bookclub_common::link::CloseKind;

    use super::{close_kind, is_frame_size_violation};

    #[test]
    fn frame_size_errors_are_recognized() {
        assert!(is_frame_size_violation(&axum::Error::new("Space limit exceeded: Message too long")));
        assert!(!is_frame_size_violation(&axum::Error::new("connection reset by peer")));
    }

    #[test]
    fn only_normal_closure_is_graceful() {
        let frame = |code| CloseFrame { code, reason: "".into() };
        assert_eq!(close_kind(Some(&frame(close_code::NORMAL))), CloseKind::Graceful);
        assert_eq!(close_kind(Some(&frame(close_code::AWAY))), CloseKind::Abnormal);
        assert_eq!(close_kind(Some(&frame(close_code::ERROR))), CloseKind::Abnormal);
        assert_eq!(close_kind(None), CloseKind::Abnormal);
    }
}
