use axum::extract::ws::{Message, WebSocket};
use bookclub_common::protocol::ws::{ClientFrame, ServerFrame};

pub fn decode_frame(raw: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str::<ClientFrame>(raw)
}

pub fn encode_frame(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let encoded = encode_frame(frame).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
