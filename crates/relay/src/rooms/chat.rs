use std::collections::VecDeque;

use bookclub_common::{
    protocol::ws::ServerFrame,
    types::{
        resolve_page_limit, validate_body, validate_emoji, Attachment, ChatMessage, Reaction,
        ReactionAction, RoomKind,
    },
};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{
    broadcast::{fan_out, Audience, Delivery},
    registry::RoomState,
    RoomHub,
};
use crate::{collab::with_retry, error::SyncError};

/// Recent messages of a chat room, oldest first, bounded to the snapshot
/// window.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
    has_more: bool,
}

impl ChatLog {
    pub fn new(messages: Vec<ChatMessage>, capacity: usize, has_more: bool) -> Self {
        let mut log = Self { messages: VecDeque::new(), capacity: capacity.max(1), has_more };
        for message in messages {
            log.push(message);
        }
        log
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
            self.has_more = true;
        }
    }

    pub fn find(&self, message_id: Uuid) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn find_mut(&mut self, message_id: Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|message| message.id == message_id)
    }

    /// The window as sent to clients: deleted messages are tombstones.
    pub fn window(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().map(ChatMessage::redacted).collect()
    }

    /// Whether older history exists beyond the window.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn require_chat_member(state: &RoomState, session_id: Uuid) -> Result<(), SyncError> {
    if !state.members.contains_key(&session_id) {
        return Err(SyncError::Validation("session has not joined a room".into()));
    }
    if state.kind() != RoomKind::Chat {
        return Err(SyncError::Validation("room does not carry chat messages".into()));
    }
    Ok(())
}

impl RoomHub {
    /// Accepts a chat message into the session's current room and fans it
    /// out to every member, the author included.
    pub async fn post_message(
        &self,
        session_id: Uuid,
        body: String,
        attachments: Vec<Attachment>,
        reply_to_id: Option<Uuid>,
    ) -> Result<ChatMessage, SyncError> {
        validate_body(&body, !attachments.is_empty())?;
        let view = self.session(session_id).await?;
        let (club_id, room_id) = Self::joined_room(&view)?;
        let author_id = view.handle.user_id();

        let mut state = self.lock_live_room(room_id).await?;
        require_chat_member(&state, session_id)?;
        state.ensure_writable()?;
        if let Some(parent_id) = reply_to_id {
            self.current_message(&state, parent_id).await?;
        }

        let stamp = state.sequencer.propose(Utc::now());
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            seq: stamp.seq,
            author_id,
            body,
            created_at: stamp.created_at,
            edited_at: None,
            deleted_at: None,
            is_system: false,
            attachments,
            reactions: Vec::new(),
            reply_to_id,
        };

        let store = &self.inner.store;
        let written =
            with_retry(&self.inner.settings.write_retry, "append_message", || {
                store.append_message(&message)
            })
            .await;
        if let Err(error) = written {
            return Err(self.write_failed(&mut state, error));
        }

        state.sequencer.accept(stamp);
        state.chat.push(message.clone());
        let frame = ServerFrame::ChatMessage { message: message.clone() };
        fan_out(&state.members, &frame, Delivery::Reliable, Audience::All);
        let member_user_ids = state.info.member_user_ids.clone();
        drop(state);

        debug!(room_id = %room_id, seq = message.seq, author_id = %author_id, "message accepted");
        self.notify_room_activity(club_id, room_id, author_id, message.created_at, &member_user_ids)
            .await;
        Ok(message)
    }

    /// Replaces a message body. Only the author may edit and an unchanged
    /// body produces no broadcast.
    pub async fn edit_message(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        content: String,
    ) -> Result<(), SyncError> {
        validate_body(&content, false)?;
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;

        let mut state = self.lock_live_room(room_id).await?;
        require_chat_member(&state, session_id)?;
        state.ensure_writable()?;

        let current = self.current_message(&state, message_id).await?;
        if current.author_id != view.handle.user_id() {
            return Err(SyncError::Authorization("only the author can edit a message".into()));
        }
        if current.body == content {
            return Ok(());
        }

        let store = &self.inner.store;
        let edited_at = Utc::now();
        let updated = match with_retry(&self.inner.settings.write_retry, "edit_message", || {
            store.edit_message(room_id, message_id, &content, edited_at)
        })
        .await
        {
            Ok(updated) => updated,
            Err(error) => return Err(self.write_failed(&mut state, error)),
        };

        let frame = ServerFrame::MessageEdited {
            message_id,
            content: updated.body.clone(),
            edited_at: updated.edited_at.unwrap_or(edited_at),
        };
        if let Some(cached) = state.chat.find_mut(message_id) {
            *cached = updated;
        }
        fan_out(&state.members, &frame, Delivery::Reliable, Audience::All);
        Ok(())
    }

    /// Soft-deletes a message. Deleting twice is a no-op.
    pub async fn delete_message(&self, session_id: Uuid, message_id: Uuid) -> Result<(), SyncError> {
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;

        let mut state = self.lock_live_room(room_id).await?;
        require_chat_member(&state, session_id)?;
        state.ensure_writable()?;

        let current = match state.chat.find(message_id) {
            Some(message) => message.clone(),
            None => self
                .inner
                .store
                .load_message(room_id, message_id)
                .await?
                .ok_or(SyncError::NotFound("message"))?,
        };
        if current.author_id != view.handle.user_id() {
            return Err(SyncError::Authorization("only the author can delete a message".into()));
        }
        if current.is_deleted() {
            return Ok(());
        }

        let store = &self.inner.store;
        let deleted_at = Utc::now();
        let updated = match with_retry(&self.inner.settings.write_retry, "soft_delete_message", || {
            store.soft_delete_message(room_id, message_id, deleted_at)
        })
        .await
        {
            Ok(updated) => updated,
            Err(error) => return Err(self.write_failed(&mut state, error)),
        };

        let frame = ServerFrame::MessageDeleted {
            message_id,
            deleted_at: updated.deleted_at.unwrap_or(deleted_at),
        };
        if let Some(cached) = state.chat.find_mut(message_id) {
            *cached = updated.redacted();
        }
        fan_out(&state.members, &frame, Delivery::Reliable, Audience::All);
        Ok(())
    }

    /// Adds or removes the caller's reaction. Repeating a mutation leaves
    /// the reaction set unchanged and broadcasts nothing.
    pub async fn react(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        emoji: &str,
        action: ReactionAction,
    ) -> Result<(), SyncError> {
        validate_emoji(emoji)?;
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;

        let mut state = self.lock_live_room(room_id).await?;
        require_chat_member(&state, session_id)?;
        state.ensure_writable()?;

        let current = self.current_message(&state, message_id).await?;
        let reaction = Reaction { user_id: view.handle.user_id(), emoji: emoji.trim().to_string() };

        let store = &self.inner.store;
        let reactions = match with_retry(&self.inner.settings.write_retry, "upsert_reaction", || {
            store.upsert_reaction(room_id, message_id, &reaction, action)
        })
        .await
        {
            Ok(reactions) => reactions,
            Err(error) => return Err(self.write_failed(&mut state, error)),
        };
        if reactions == current.reactions {
            return Ok(());
        }

        if let Some(cached) = state.chat.find_mut(message_id) {
            cached.reactions = reactions.clone();
        }
        let frame = ServerFrame::ReactionUpdated { message_id, reactions };
        fan_out(&state.members, &frame, Delivery::Reliable, Audience::All);
        Ok(())
    }

    /// One page of history strictly before `before`, oldest first. Read
    /// straight from the store without taking the room lock.
    pub async fn load_older_messages(
        &self,
        session_id: Uuid,
        before: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<ServerFrame, SyncError> {
        let limit = resolve_page_limit(limit)? as usize;
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;

        let mut messages = self.inner.store.load_older_messages(room_id, before, limit + 1).await?;
        let has_more = messages.len() > limit;
        if has_more {
            messages.drain(..messages.len() - limit);
        }

        let messages = messages.into_iter().map(ChatMessage::redacted).collect();
        Ok(ServerFrame::OlderMessages { room_id, messages, has_more })
    }

    /// A live, undeleted message of the room, from the window or the store.
    async fn current_message(
        &self,
        state: &RoomState,
        message_id: Uuid,
    ) -> Result<ChatMessage, SyncError> {
        let message = match state.chat.find(message_id) {
            Some(message) => Some(message.clone()),
            None => self.inner.store.load_message(state.room_id(), message_id).await?,
        };
        message.filter(|message| !message.is_deleted()).ok_or(SyncError::NotFound("message"))
    }
}
