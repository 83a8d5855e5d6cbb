use std::{collections::HashMap, sync::Arc, time::Duration};

use bookclub_common::types::{DocumentState, RoomInfo, RoomKind};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{chat::ChatLog, document::DocumentSync, sequencer::RoomSequencer};
use crate::{
    collab::{RoomStore, StoreError},
    error::SyncError,
    presence::PresenceSet,
    ws::session::SessionHandle,
};

/// Live state of one room. Every mutation and every fan-out for the room
/// happens while holding its lock.
#[derive(Debug)]
pub struct RoomState {
    pub info: RoomInfo,
    pub members: HashMap<Uuid, SessionHandle>,
    pub presence: PresenceSet,
    pub sequencer: RoomSequencer,
    pub chat: ChatLog,
    /// Present for editor rooms only.
    pub document: Option<DocumentSync>,
    read_only_until: Option<Instant>,
    /// Set when the registry dropped this room. Holders of a stale handle
    /// must look the room up again.
    pub evicted: bool,
}

impl RoomState {
    fn new(info: RoomInfo, chat: ChatLog, sequencer: RoomSequencer, document: Option<DocumentSync>) -> Self {
        Self {
            info,
            members: HashMap::new(),
            presence: PresenceSet::default(),
            sequencer,
            chat,
            document,
            read_only_until: None,
            evicted: false,
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.info.room_id
    }

    pub fn kind(&self) -> RoomKind {
        self.info.kind
    }

    pub fn ensure_writable(&mut self) -> Result<(), SyncError> {
        match self.read_only_until {
            Some(until) if Instant::now() < until => Err(SyncError::ReadOnly),
            Some(_) => {
                info!(room_id = %self.info.room_id, "room writable again");
                self.read_only_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Rejects writes for `cooldown`. Reads and ephemeral traffic continue.
    pub fn degrade(&mut self, cooldown: Duration) {
        self.read_only_until = Some(Instant::now() + cooldown);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn is_idle(&self) -> bool {
        self.members.is_empty() && self.presence.is_empty()
    }
}

#[derive(Debug)]
pub struct RoomHandle {
    pub room_id: Uuid,
    pub club_id: Uuid,
    pub kind: RoomKind,
    pub state: Arc<Mutex<RoomState>>,
}

/// Rooms currently held in memory, loaded on first use and dropped when the
/// last member and the last presence hold are gone.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<RoomHandle>>>,
}

impl RoomRegistry {
    pub async fn get(&self, room_id: Uuid) -> Option<Arc<RoomHandle>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    pub async fn get_or_load(
        &self,
        room_id: Uuid,
        store: &dyn RoomStore,
        recent_window: usize,
    ) -> Result<Arc<RoomHandle>, SyncError> {
        if let Some(room) = self.get(room_id).await {
            return Ok(room);
        }

        // Hydrate outside the map lock; a concurrent loader may win the insert.
        let loaded = load_room(room_id, store, recent_window).await?;
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_insert_with(|| Arc::new(loaded));
        Ok(Arc::clone(room))
    }

    /// Drops the room when nobody is in it. A room whose lock is busy is
    /// left alone; its holder will try again when done.
    pub async fn evict_if_idle(&self, room_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&room_id) else {
            return false;
        };
        let Ok(mut state) = room.state.try_lock() else {
            return false;
        };
        if !state.is_idle() {
            return false;
        }
        state.evicted = true;
        drop(state);
        rooms.remove(&room_id);
        debug!(room_id = %room_id, "evicted idle room");
        true
    }

    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Arc<RoomHandle>> =
            self.rooms.write().await.drain().map(|(_, room)| room).collect();
        for room in &drained {
            room.state.lock().await.evicted = true;
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }
}

async fn load_room(
    room_id: Uuid,
    store: &dyn RoomStore,
    recent_window: usize,
) -> Result<RoomHandle, SyncError> {
    let info = store.load_room(room_id).await?;
    let window = recent_window.max(1);

    let (chat, sequencer, document) = match info.kind {
        RoomKind::Chat => {
            let mut recent = store.load_recent_messages(room_id, window + 1).await?;
            let has_more = recent.len() > window;
            if has_more {
                recent.remove(0);
            }
            let sequencer = RoomSequencer::from_messages(&recent);
            (ChatLog::new(recent, window, has_more), sequencer, None)
        }
        RoomKind::Editor => {
            let document = match store.load_document(room_id).await {
                Ok(Some(document)) => document,
                Ok(None) | Err(StoreError::NotFound(_)) => DocumentState::empty(room_id),
                Err(error) => return Err(error.into()),
            };
            let chat = ChatLog::new(Vec::new(), window, false);
            (chat, RoomSequencer::default(), Some(DocumentSync::new(document)))
        }
    };

    debug!(room_id = %room_id, kind = ?info.kind, "loaded room");
    Ok(RoomHandle {
        room_id,
        club_id: info.club_id,
        kind: info.kind,
        state: Arc::new(Mutex::new(RoomState::new(info, chat, sequencer, document))),
    })
}
