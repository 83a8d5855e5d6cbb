use std::collections::HashMap;

use bookclub_common::{
    protocol::ws::ServerFrame,
    types::{CursorEntry, CursorPosition, DocumentState},
};
use tracing::debug;
use uuid::Uuid;

use super::{
    broadcast::{fan_out, Audience, Delivery},
    registry::RoomState,
    RoomHub,
};
use crate::{collab::with_retry, error::SyncError, metrics};

/// Authoritative document of an editor room plus the ephemeral cursors of
/// the users editing it.
#[derive(Debug, Clone)]
pub struct DocumentSync {
    pub doc: DocumentState,
    cursors: HashMap<Uuid, CursorPosition>,
}

impl DocumentSync {
    pub fn new(doc: DocumentState) -> Self {
        Self { doc, cursors: HashMap::new() }
    }

    /// Last write wins per user.
    pub fn set_cursor(&mut self, user_id: Uuid, cursor: CursorPosition) {
        self.cursors.insert(user_id, cursor);
    }

    pub fn remove_cursor(&mut self, user_id: Uuid) {
        self.cursors.remove(&user_id);
    }

    pub fn cursor_entries(&self) -> Vec<CursorEntry> {
        let mut entries: Vec<CursorEntry> = self
            .cursors
            .iter()
            .map(|(user_id, cursor)| CursorEntry { user_id: *user_id, cursor: *cursor })
            .collect();
        entries.sort_by_key(|entry| entry.user_id);
        entries
    }
}

fn require_editor_member(
    state: &mut RoomState,
    session_id: Uuid,
) -> Result<&mut DocumentSync, SyncError> {
    if !state.members.contains_key(&session_id) {
        return Err(SyncError::Validation("session has not joined a room".into()));
    }
    state
        .document
        .as_mut()
        .ok_or_else(|| SyncError::Validation("room has no shared document".into()))
}

impl RoomHub {
    /// Applies a full-text edit made against `base_revision`.
    ///
    /// On success every other session in the room receives the new text and
    /// the returned ack goes to the editor alone. An edit against anything
    /// but the current revision is rejected with the current state so the
    /// client can rebase.
    pub async fn apply_edit(
        &self,
        session_id: Uuid,
        text: String,
        base_revision: u64,
    ) -> Result<ServerFrame, SyncError> {
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;

        let mut state = self.lock_live_room(room_id).await?;
        require_editor_member(&mut state, session_id)?;
        state.ensure_writable()?;

        // Every accepted edit takes a new revision, identical text included,
        // so at most one edit per base revision can win.
        let current_revision = {
            let document = require_editor_member(&mut state, session_id)?;
            if base_revision != document.doc.revision {
                metrics::increment_stale_revisions();
                return Err(SyncError::StaleRevision {
                    current_revision: document.doc.revision,
                    text: document.doc.text.clone(),
                });
            }
            document.doc.revision
        };

        let revision = current_revision + 1;
        let store = &self.inner.store;
        let saved = with_retry(&self.inner.settings.write_retry, "save_document", || {
            store.save_document(room_id, &text, revision)
        })
        .await;
        if let Err(error) = saved {
            return Err(self.write_failed(&mut state, error));
        }

        let document = require_editor_member(&mut state, session_id)?;
        document.doc.text = text.clone();
        document.doc.revision = revision;

        let frame = ServerFrame::DocumentUpdated { room_id, text, revision };
        fan_out(&state.members, &frame, Delivery::Reliable, Audience::ExceptSession(session_id));
        debug!(room_id = %room_id, revision, "document revision committed");

        Ok(ServerFrame::DocumentAck { room_id, revision })
    }

    /// Relays a cursor position to the other sessions in the room. Cursors
    /// are never persisted and keep flowing while the room is read-only.
    pub async fn move_cursor(
        &self,
        session_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), SyncError> {
        let view = self.session(session_id).await?;
        let (_, room_id) = Self::joined_room(&view)?;
        let user_id = view.handle.user_id();

        let mut state = self.lock_live_room(room_id).await?;
        require_editor_member(&mut state, session_id)?.set_cursor(user_id, cursor);

        let frame = ServerFrame::CursorUpdate { room_id, user_id, cursor };
        fan_out(&state.members, &frame, Delivery::BestEffort, Audience::ExceptSession(session_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_are_last_write_wins_per_user() {
        let mut sync = DocumentSync::new(DocumentState::empty(Uuid::from_u128(10)));
        let user = Uuid::from_u128(1);
        sync.set_cursor(user, CursorPosition { line: 1, column: 1 });
        sync.set_cursor(user, CursorPosition { line: 4, column: 2 });
        sync.set_cursor(Uuid::from_u128(2), CursorPosition { line: 0, column: 0 });

        let entries = sync.cursor_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cursor, CursorPosition { line: 4, column: 2 });

        sync.remove_cursor(user);
        assert_eq!(sync.cursor_entries().len(), 1);
    }
}
