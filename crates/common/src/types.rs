// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_MESSAGE_BODY_CHARS: usize = 4_000;
pub const MAX_EMOJI_BYTES: usize = 64;
pub const MAX_SECTION_CHARS: usize = 64;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_PAGE_LIMIT: u32 = 30;

/// Verified identity of a connected user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Chat,
    Editor,
}

/// Directory entry for a room. `member_user_ids` is informational and is not
/// an authorization boundary on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: Uuid,
    pub club_id: Uuid,
    pub kind: RoomKind,
    #[serde(default)]
    pub member_user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// A chat message. Immutable after creation except for edit, soft-delete and
/// reaction mutations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    /// Per-room acceptance order.
    pub seq: u64,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
}

impl ChatMessage {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Strips the content of a deleted message, leaving only its tombstone.
    pub fn redacted(mut self) -> Self {
        if self.is_deleted() {
            self.body.clear();
            self.attachments.clear();
            self.reactions.clear();
            self.reply_to_id = None;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorEntry {
    pub user_id: Uuid,
    pub cursor: CursorPosition,
}

/// Authoritative text of an editor room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub room_id: Uuid,
    pub text: String,
    pub revision: u64,
}

impl DocumentState {
    pub fn empty(room_id: Uuid) -> Self {
        Self { room_id, text: String::new(), revision: 0 }
    }
}

/// Applies a reaction mutation to a reaction set keyed by `(user_id, emoji)`.
///
/// Returns `true` when the set changed. Adding an existing reaction or
/// removing an absent one is a no-op.
pub fn apply_reaction(
    reactions: &mut Vec<Reaction>,
    user_id: Uuid,
    emoji: &str,
    action: ReactionAction,
) -> bool {
    let position = reactions.iter().position(|r| r.user_id == user_id && r.emoji == emoji);
    match (action, position) {
        (ReactionAction::Add, None) => {
            reactions.push(Reaction { user_id, emoji: emoji.to_string() });
            reactions.sort();
            true
        }
        (ReactionAction::Remove, Some(index)) => {
            reactions.remove(index);
            true
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("message body exceeds {MAX_MESSAGE_BODY_CHARS} characters")]
    BodyTooLong,
    #[error("emoji must be between 1 and {MAX_EMOJI_BYTES} bytes")]
    InvalidEmoji,
    #[error("section name must be between 1 and {MAX_SECTION_CHARS} characters")]
    InvalidSection,
    #[error("page limit must be between 1 and {MAX_PAGE_LIMIT}")]
    InvalidPageLimit,
}

/// Validates a chat body. Attachment-only messages may have an empty body.
pub fn validate_body(body: &str, has_attachments: bool) -> Result<(), ValidationError> {
    let trimmed = body.trim();
    if trimmed.is_empty() && !has_attachments {
        return Err(ValidationError::EmptyBody);
    }
    if trimmed.chars().count() > MAX_MESSAGE_BODY_CHARS {
        return Err(ValidationError::BodyTooLong);
    }
    Ok(())
}

pub fn validate_emoji(emoji: &str) -> Result<(), ValidationError> {
    let trimmed = emoji.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_EMOJI_BYTES {
        return Err(ValidationError::InvalidEmoji);
    }
    Ok(())
}

pub fn validate_section(section: &str) -> Result<(), ValidationError> {
    let trimmed = section.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_SECTION_CHARS {
        return Err(ValidationError::InvalidSection);
    }
    Ok(())
}

/// Resolves an optional client page size to a bounded limit.
pub fn resolve_page_limit(limit: Option<u32>) -> Result<u32, ValidationError> {
    match limit {
        None => Ok(DEFAULT_PAGE_LIMIT),
        Some(value) if (1..=MAX_PAGE_LIMIT).contains(&value) => Ok(value),
        Some(_) => Err(ValidationError::InvalidPageLimit),
    }
}
