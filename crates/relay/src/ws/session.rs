use std::{collections::HashMap, sync::Arc};

use bookclub_common::{link::Focus, protocol::ws::ServerFrame, types::UserIdentity};
use chrono::{DateTime, Utc};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify, RwLock,
};
use uuid::Uuid;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 262_144;

/// Sending side of one admitted connection.
///
/// Broadcasts go through a bounded queue drained by the socket task. `kick`
/// asks the socket task to drop the connection as if the network failed.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub identity: UserIdentity,
    outbound: mpsc::Sender<ServerFrame>,
    kicked: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(identity: UserIdentity, queue_capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (outbound, receiver) = mpsc::channel(queue_capacity.max(1));
        let handle = Self {
            session_id: Uuid::new_v4(),
            identity,
            outbound,
            kicked: Arc::new(Notify::new()),
        };
        (handle, receiver)
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    pub fn try_send(&self, frame: ServerFrame) -> Result<(), TrySendError<ServerFrame>> {
        self.outbound.try_send(frame)
    }

    pub fn kick(&self) {
        self.kicked.notify_one();
    }

    pub fn kicked(&self) -> Arc<Notify> {
        Arc::clone(&self.kicked)
    }
}

/// A session's registration as seen by the room engine.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub handle: SessionHandle,
    pub club_id: Option<Uuid>,
    /// The room the session has joined, or the section it is viewing.
    pub focus: Option<Focus>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl SessionView {
    pub fn active_room(&self) -> Option<Uuid> {
        match &self.focus {
            Some(Focus::Room(room_id)) => Some(*room_id),
            _ => None,
        }
    }
}

/// Table of admitted sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, SessionView>>,
}

impl SessionStore {
    pub async fn register(&self, handle: SessionHandle) {
        let now = Utc::now();
        let view = SessionView {
            handle,
            club_id: None,
            focus: None,
            connected_at: now,
            last_seen_at: now,
        };
        self.sessions.write().await.insert(view.handle.session_id, view);
    }

    pub async fn unregister(&self, session_id: Uuid) -> Option<SessionView> {
        self.sessions.write().await.remove(&session_id)
    }

    pub async fn get(&self, session_id: Uuid) -> Option<SessionView> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn set_focus(&self, session_id: Uuid, club_id: Uuid, focus: Option<Focus>) -> bool {
        let mut guard = self.sessions.write().await;
        let Some(view) = guard.get_mut(&session_id) else {
            return false;
        };
        view.club_id = Some(club_id);
        view.focus = focus;
        true
    }

    pub async fn touch(&self, session_id: Uuid) {
        if let Some(view) = self.sessions.write().await.get_mut(&session_id) {
            view.last_seen_at = Utc::now();
        }
    }

    /// Sessions that have established context in `club_id`.
    pub async fn in_club(&self, club_id: Uuid) -> Vec<SessionView> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|view| view.club_id == Some(club_id))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
