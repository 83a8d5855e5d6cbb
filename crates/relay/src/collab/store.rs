use async_trait::async_trait;
use bookclub_common::types::{ChatMessage, DocumentState, Reaction, ReactionAction, RoomInfo};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable, per-room consistent storage for rooms, messages and documents.
///
/// Message lists are always returned oldest first.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn load_room(&self, room_id: Uuid) -> Result<RoomInfo, StoreError>;

    /// Every room of the club, in no particular order.
    async fn list_club_rooms(&self, club_id: Uuid) -> Result<Vec<RoomInfo>, StoreError>;

    /// Persists a new message. Appending a message id that already exists is
    /// a no-op so retried writes never duplicate.
    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn load_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<ChatMessage>, StoreError>;

    async fn load_recent_messages(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Messages created strictly before `before`, newest `limit` of them.
    async fn load_older_messages(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Applies a reaction mutation and returns the message's full reaction set.
    async fn upsert_reaction(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        reaction: &Reaction,
        action: ReactionAction,
    ) -> Result<Vec<Reaction>, StoreError>;

    async fn edit_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError>;

    /// Marks a message deleted. Deleting an already deleted message returns
    /// it unchanged.
    async fn soft_delete_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError>;

    async fn load_document(&self, room_id: Uuid) -> Result<Option<DocumentState>, StoreError>;

    async fn save_document(
        &self,
        room_id: Uuid,
        text: &str,
        revision: u64,
    ) -> Result<(), StoreError>;
}
