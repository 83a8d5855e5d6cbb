// WebSocket frame types for the bookclub-rooms protocol.
//
// Every frame is a JSON object `{"type": "<kebab-case>", ...camelCase payload}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Attachment, ChatMessage, CursorEntry, CursorPosition, Reaction, ReactionAction, RoomKind,
    UserIdentity,
};

pub const CURRENT_PROTOCOL_VERSION: &str = "bookclub-rooms.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION, "bookclub-rooms.v0"];

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Admission handshake; must be the first frame on a connection.
    Hello {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<String>,
    },
    Join {
        club_id: Uuid,
        room_id: Uuid,
    },
    SwitchRoom {
        room_id: Uuid,
    },
    ViewRoom {
        room_id: Uuid,
    },
    /// Focus a non-room section. `club_id` establishes club context when the
    /// connection has not joined a room yet.
    ViewSection {
        section: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        club_id: Option<Uuid>,
    },
    ChatMessage {
        body: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<Uuid>,
    },
    LoadOlderMessages {
        before: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    EditDocument {
        text: String,
        base_revision: u64,
    },
    CursorMove {
        line: u32,
        column: u32,
    },
    React {
        message_id: Uuid,
        emoji: String,
        action: ReactionAction,
    },
    EditMessage {
        message_id: Uuid,
        content: String,
    },
    DeleteMessage {
        message_id: Uuid,
    },
    /// Explicit logout from the club context. Presence is removed at once.
    Leave,
}

impl ClientFrame {
    /// Stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Join { .. } => "join",
            Self::SwitchRoom { .. } => "switch-room",
            Self::ViewRoom { .. } => "view-room",
            Self::ViewSection { .. } => "view-section",
            Self::ChatMessage { .. } => "chat-message",
            Self::LoadOlderMessages { .. } => "load-older-messages",
            Self::EditDocument { .. } => "edit-document",
            Self::CursorMove { .. } => "cursor-move",
            Self::React { .. } => "react",
            Self::EditMessage { .. } => "edit-message",
            Self::DeleteMessage { .. } => "delete-message",
            Self::Leave => "leave",
        }
    }
}

/// Full room state sent on join, switch and reconnect. Never a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub kind: RoomKind,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default)]
    pub cursors: Vec<CursorEntry>,
    pub presence: Vec<UserIdentity>,
    #[serde(default)]
    pub members: Vec<Uuid>,
    #[serde(default)]
    pub unread_room_ids: Vec<Uuid>,
    #[serde(default)]
    pub unread_sections: Vec<String>,
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    HelloAck {
        user: UserIdentity,
        server_time: DateTime<Utc>,
        protocol_version: String,
    },
    Init(RoomSnapshot),
    RoomSwitched(RoomSnapshot),
    ChatMessage {
        message: ChatMessage,
    },
    OlderMessages {
        room_id: Uuid,
        messages: Vec<ChatMessage>,
        has_more: bool,
    },
    UserJoined {
        room_id: Uuid,
        user: UserIdentity,
    },
    UserLeft {
        room_id: Uuid,
        user_id: Uuid,
    },
    RoomActivity {
        room_id: Uuid,
    },
    SectionActivity {
        section: String,
    },
    ReactionUpdated {
        message_id: Uuid,
        reactions: Vec<Reaction>,
    },
    MessageEdited {
        message_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    },
    DocumentUpdated {
        room_id: Uuid,
        text: String,
        revision: u64,
    },
    /// Sent only to the session whose edit was accepted.
    DocumentAck {
        room_id: Uuid,
        revision: u64,
    },
    CursorUpdate {
        room_id: Uuid,
        user_id: Uuid,
        cursor: CursorPosition,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HelloAck { .. } => "hello-ack",
            Self::Init(_) => "init",
            Self::RoomSwitched(_) => "room-switched",
            Self::ChatMessage { .. } => "chat-message",
            Self::OlderMessages { .. } => "older-messages",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::RoomActivity { .. } => "room-activity",
            Self::SectionActivity { .. } => "section-activity",
            Self::ReactionUpdated { .. } => "reaction-updated",
            Self::MessageEdited { .. } => "message-edited",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::DocumentUpdated { .. } => "document-updated",
            Self::DocumentAck { .. } => "document-ack",
            Self::CursorUpdate { .. } => "cursor-update",
            Self::Error { .. } => "error",
        }
    }
}
