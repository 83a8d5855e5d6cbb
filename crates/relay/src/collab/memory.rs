// In-process RoomStore used for local development and tests.

use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use bookclub_common::types::{
    apply_reaction, ChatMessage, DocumentState, Reaction, ReactionAction, RoomInfo,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{RoomStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    rooms: HashMap<Uuid, RoomInfo>,
    /// Per room, ordered by `created_at`.
    messages: HashMap<Uuid, Vec<ChatMessage>>,
    documents: HashMap<Uuid, DocumentState>,
}

#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    state: RwLock<MemoryState>,
    failing_writes: AtomicU32,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rooms(rooms: impl IntoIterator<Item = RoomInfo>) -> Self {
        let state = MemoryState {
            rooms: rooms.into_iter().map(|room| (room.room_id, room)).collect(),
            ..MemoryState::default()
        };
        Self { state: RwLock::new(state), failing_writes: AtomicU32::new(0) }
    }

    /// Seeds the room directory from a JSON array of room entries.
    pub fn from_rooms_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rooms file {}", path.display()))?;
        let rooms: Vec<RoomInfo> = serde_json::from_str(&raw)
            .with_context(|| format!("rooms file {} is not a valid room list", path.display()))?;
        Ok(Self::with_rooms(rooms))
    }

    pub async fn insert_room(&self, room: RoomInfo) {
        self.state.write().await.rooms.insert(room.room_id, room);
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Makes the next `count` write operations fail with `Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub async fn stored_messages(&self, room_id: Uuid) -> Vec<ChatMessage> {
        self.state.read().await.messages.get(&room_id).cloned().unwrap_or_default()
    }

    pub async fn stored_document(&self, room_id: Uuid) -> Option<DocumentState> {
        self.state.read().await.documents.get(&room_id).cloned()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            Err(StoreError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

fn find_message<'a>(
    state: &'a mut MemoryState,
    room_id: Uuid,
    message_id: Uuid,
) -> Result<&'a mut ChatMessage, StoreError> {
    state
        .messages
        .get_mut(&room_id)
        .and_then(|messages| messages.iter_mut().find(|message| message.id == message_id))
        .ok_or(StoreError::NotFound("message"))
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn load_room(&self, room_id: Uuid) -> Result<RoomInfo, StoreError> {
        self.state.read().await.rooms.get(&room_id).cloned().ok_or(StoreError::NotFound("room"))
    }

    async fn list_club_rooms(&self, club_id: Uuid) -> Result<Vec<RoomInfo>, StoreError> {
        let state = self.state.read().await;
        Ok(state.rooms.values().filter(|room| room.club_id == club_id).cloned().collect())
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let messages = state.messages.entry(message.room_id).or_default();
        if messages.iter().any(|existing| existing.id == message.id) {
            return Ok(());
        }
        let position = messages.partition_point(|existing| existing.created_at <= message.created_at);
        messages.insert(position, message.clone());
        Ok(())
    }

    async fn load_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(&room_id)
            .and_then(|messages| messages.iter().find(|message| message.id == message_id))
            .cloned())
    }

    async fn load_recent_messages(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.state.read().await;
        let messages = state.messages.get(&room_id).map(Vec::as_slice).unwrap_or_default();
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn load_older_messages(
        &self,
        room_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.state.read().await;
        let messages = state.messages.get(&room_id).map(Vec::as_slice).unwrap_or_default();
        let end = messages.partition_point(|message| message.created_at < before);
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].to_vec())
    }

    async fn upsert_reaction(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        reaction: &Reaction,
        action: ReactionAction,
    ) -> Result<Vec<Reaction>, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let message = find_message(&mut state, room_id, message_id)?;
        apply_reaction(&mut message.reactions, reaction.user_id, &reaction.emoji, action);
        Ok(message.reactions.clone())
    }

    async fn edit_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let message = find_message(&mut state, room_id, message_id)?;
        if message.body != content {
            message.body = content.to_string();
            message.edited_at = Some(edited_at);
        }
        Ok(message.clone())
    }

    async fn soft_delete_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let message = find_message(&mut state, room_id, message_id)?;
        if message.deleted_at.is_none() {
            message.deleted_at = Some(deleted_at);
            *message = message.clone().redacted();
        }
        Ok(message.clone())
    }

    async fn load_document(&self, room_id: Uuid) -> Result<Option<DocumentState>, StoreError> {
        Ok(self.state.read().await.documents.get(&room_id).cloned())
    }

    async fn save_document(
        &self,
        room_id: Uuid,
        text: &str,
        revision: u64,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let document =
            state.documents.entry(room_id).or_insert_with(|| DocumentState::empty(room_id));
        if revision > document.revision {
            document.text = text.to_string();
            document.revision = revision;
        }
        Ok(())
    }
}
