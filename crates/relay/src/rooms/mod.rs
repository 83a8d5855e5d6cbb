// Room engine: admission of sessions into rooms, presence, fan-out and the
// unread bookkeeping that goes with them.
//
// Lock order is room state first, then the session table or unread ledger.
// Nothing takes a room lock while holding either of those.

pub mod broadcast;
pub mod chat;
pub mod document;
pub mod registry;
pub mod sequencer;


use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bookclub_common::{
    link::{CloseKind, Focus},
    protocol::ws::{RoomSnapshot, ServerFrame},
    types::{validate_section, RoomKind, UserIdentity},
};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::{
    broadcast::{deliver, fan_out, Audience, Delivery},
    registry::{RoomRegistry, RoomState},
};
use crate::{
    collab::{RetryPolicy, RoomAuthorizer, RoomStore, StoreError},
    error::SyncError,
    metrics,
    presence::{AttachOutcome, DetachOutcome},
    reconnect::{teardown_for, ReconnectCoordinator, Teardown},
    unread::{UnreadLedger, UnreadSummary},
    ws::session::{SessionHandle, SessionStore, SessionView},
};

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub reconnect_grace: Duration,
    pub outbound_queue: usize,
    pub recent_window: usize,
    pub write_retry: RetryPolicy,
    pub read_only_cooldown: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_millis(5_000),
            outbound_queue: 256,
            recent_window: 50,
            write_retry: RetryPolicy::default(),
            read_only_cooldown: Duration::from_millis(30_000),
        }
    }
}

struct HubInner {
    settings: HubSettings,
    store: Arc<dyn RoomStore>,
    authorizer: Arc<dyn RoomAuthorizer>,
    registry: RoomRegistry,
    sessions: SessionStore,
    unread: UnreadLedger,
    reconnect: ReconnectCoordinator,
}

/// Shared handle to the room engine. Cheap to clone.
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

impl RoomHub {
    pub fn new(
        store: Arc<dyn RoomStore>,
        authorizer: Arc<dyn RoomAuthorizer>,
        settings: HubSettings,
    ) -> Self {
        let reconnect = ReconnectCoordinator::new(settings.reconnect_grace);
        Self {
            inner: Arc::new(HubInner {
                settings,
                store,
                authorizer,
                registry: RoomRegistry::default(),
                sessions: SessionStore::default(),
                unread: UnreadLedger::new(),
                reconnect,
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    pub fn authorizer(&self) -> &Arc<dyn RoomAuthorizer> {
        &self.inner.authorizer
    }

    pub fn unread(&self) -> &UnreadLedger {
        &self.inner.unread
    }

    pub fn reconnect(&self) -> &ReconnectCoordinator {
        &self.inner.reconnect
    }

    /// Creates the outbound side of a new connection.
    pub fn open_session(&self, identity: UserIdentity) -> (SessionHandle, mpsc::Receiver<ServerFrame>) {
        SessionHandle::new(identity, self.inner.settings.outbound_queue)
    }

    /// Registers an admitted session. It has no club or room until it joins.
    pub async fn connect(&self, handle: SessionHandle) {
        let user_id = handle.user_id();
        let session_id = handle.session_id;
        self.inner.sessions.register(handle).await;
        self.inner.reconnect.session_opened(user_id);
        metrics::session_opened();
        info!(session_id = %session_id, user_id = %user_id, "session admitted");
    }

    /// Tears a session down. An abnormal close while in a room holds the
    /// user's presence for the reconnect grace window.
    pub async fn disconnect(&self, session_id: Uuid, close: CloseKind) {
        let Some(view) = self.inner.sessions.unregister(session_id).await else {
            return;
        };
        let user_id = view.handle.user_id();
        self.inner.reconnect.session_closed(user_id);
        metrics::session_closed();

        if let Some(room_id) = view.active_room() {
            let linger =
                teardown_for(false, view.focus.as_ref(), Some(close)) == Teardown::Linger;
            self.leave_room(session_id, user_id, room_id, linger).await;
        }
        info!(session_id = %session_id, user_id = %user_id, close = ?close, "session closed");
    }

    pub async fn touch(&self, session_id: Uuid) {
        self.inner.sessions.touch(session_id).await;
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.len().await
    }

    pub async fn loaded_rooms(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Joins `room_id` within `club_id`. A session already in another room
    /// is moved, as with `switch_room`.
    pub async fn join(
        &self,
        session_id: Uuid,
        club_id: Uuid,
        room_id: Uuid,
    ) -> Result<RoomSnapshot, SyncError> {
        self.enter_room(session_id, club_id, room_id).await
    }

    /// Moves the session to another room of its club. Observers of the old
    /// room see a leave only if the user has no other session there.
    pub async fn switch_room(
        &self,
        session_id: Uuid,
        room_id: Uuid,
    ) -> Result<RoomSnapshot, SyncError> {
        let view = self.session(session_id).await?;
        let club_id = view
            .club_id
            .ok_or_else(|| SyncError::Validation("join a room before switching".into()))?;
        self.enter_room(session_id, club_id, room_id).await
    }

    /// Acknowledges a room as read without joining it.
    pub async fn view_room(&self, session_id: Uuid, room_id: Uuid) -> Result<(), SyncError> {
        let view = self.session(session_id).await?;
        let club_id = view
            .club_id
            .ok_or_else(|| SyncError::Validation("no club context on this connection".into()))?;
        let user_id = view.handle.user_id();

        let room = self.inner.store.load_room(room_id).await?;
        if room.club_id != club_id {
            return Err(SyncError::NotFound("room"));
        }
        if !self.inner.authorizer.can_join_room(user_id, room_id).await {
            return Err(SyncError::Authorization("not a member of this room".into()));
        }
        self.inner.unread.view(user_id, club_id, Focus::Room(room_id), Utc::now()).await;
        Ok(())
    }

    /// Focuses a non-room section. Leaving a room this way is immediate: the
    /// connection is alive, so there is nothing to wait for. Naming a club
    /// other than the one the session already entered requires club access.
    pub async fn view_section(
        &self,
        session_id: Uuid,
        section: &str,
        club_id: Option<Uuid>,
    ) -> Result<(), SyncError> {
        validate_section(section)?;
        let view = self.session(session_id).await?;
        let user_id = view.handle.user_id();
        let club_id = match (club_id, view.club_id) {
            (Some(requested), Some(current)) if requested == current => current,
            (Some(requested), _) => {
                if !self.inner.authorizer.can_view_club(user_id, requested).await {
                    return Err(SyncError::Authorization("not a member of this club".into()));
                }
                requested
            }
            (None, Some(current)) => current,
            (None, None) => {
                return Err(SyncError::Validation("no club context on this connection".into()))
            }
        };
        let target = Focus::Section(section.trim().to_string());

        if let Some(room_id) = view.active_room() {
            if teardown_for(true, Some(&target), None) == Teardown::Immediate {
                self.leave_room(session_id, user_id, room_id, false).await;
            }
        }
        self.inner.sessions.set_focus(session_id, club_id, Some(target.clone())).await;
        self.inner.unread.view(user_id, club_id, target, Utc::now()).await;
        Ok(())
    }

    /// Users currently present in a room, earliest joiner first.
    pub async fn presence(&self, room_id: Uuid) -> Vec<UserIdentity> {
        match self.inner.registry.get(room_id).await {
            Some(room) => room.state.lock().await.presence.users(),
            None => Vec::new(),
        }
    }

    pub async fn unread_summary(&self, user_id: Uuid, club_id: Uuid) -> UnreadSummary {
        self.inner.unread.summary(user_id, club_id).await
    }

    /// Records activity in a non-room section for every club user not
    /// looking at it and pushes a hint to their live sessions. Returns the
    /// number of users marked. The actor and every listed member must
    /// belong to the club; listed outsiders are skipped.
    pub async fn notify_section_activity(
        &self,
        club_id: Uuid,
        section: &str,
        actor: Option<Uuid>,
        extra_members: &[Uuid],
        at: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        validate_section(section)?;
        let authorizer = &self.inner.authorizer;
        if let Some(actor) = actor {
            if !authorizer.can_view_club(actor, club_id).await {
                return Err(SyncError::Authorization("not a member of this club".into()));
            }
        }
        let mut members = Vec::with_capacity(extra_members.len());
        for user_id in extra_members {
            if authorizer.can_view_club(*user_id, club_id).await {
                members.push(*user_id);
            } else {
                debug!(club_id = %club_id, user_id = %user_id, "skipping section activity for non-member");
            }
        }
        let target = Focus::Section(section.trim().to_string());
        let sessions = self.inner.sessions.in_club(club_id).await;

        let viewing: HashSet<Uuid> = sessions
            .iter()
            .filter(|view| view.focus.as_ref() == Some(&target))
            .map(|view| view.handle.user_id())
            .collect();
        let recipients: HashSet<Uuid> = sessions
            .iter()
            .map(|view| view.handle.user_id())
            .chain(members)
            .filter(|user_id| Some(*user_id) != actor && !viewing.contains(user_id))
            .collect();

        for user_id in &recipients {
            self.inner.unread.notify(*user_id, club_id, target.clone(), at).await;
        }
        let frame = ServerFrame::SectionActivity { section: section.trim().to_string() };
        for view in sessions.iter().filter(|view| recipients.contains(&view.handle.user_id())) {
            deliver(&view.handle, frame.clone(), Delivery::BestEffort);
        }
        Ok(recipients.len())
    }

    /// Drops every loaded room. Sessions are closed by the server shutting
    /// down their sockets.
    pub async fn shutdown(&self) -> usize {
        self.inner.registry.shutdown().await
    }

    async fn session(&self, session_id: Uuid) -> Result<SessionView, SyncError> {
        self.inner.sessions.get(session_id).await.ok_or(SyncError::NotFound("session"))
    }

    fn joined_room(view: &SessionView) -> Result<(Uuid, Uuid), SyncError> {
        match (view.club_id, view.active_room()) {
            (Some(club_id), Some(room_id)) => Ok((club_id, room_id)),
            _ => Err(SyncError::Validation("session has not joined a room".into())),
        }
    }

    /// Locks a loaded room, loading it if needed. Retries when the handle
    /// was evicted between lookup and lock.
    async fn lock_live_room(&self, room_id: Uuid) -> Result<OwnedMutexGuard<RoomState>, SyncError> {
        loop {
            let room = self
                .inner
                .registry
                .get_or_load(room_id, self.inner.store.as_ref(), self.inner.settings.recent_window)
                .await?;
            let state = Arc::clone(&room.state).lock_owned().await;
            if !state.evicted {
                return Ok(state);
            }
        }
    }

    /// Maps a failed store write to the caller's error. Exhausted transient
    /// failures put the room into read-only mode for the cooldown.
    fn write_failed(&self, state: &mut RoomState, error: StoreError) -> SyncError {
        if error.is_transient() {
            state.degrade(self.inner.settings.read_only_cooldown);
            metrics::increment_write_retries_exhausted();
            warn!(
                room_id = %state.room_id(),
                error = %error,
                cooldown_ms = self.inner.settings.read_only_cooldown.as_millis() as u64,
                "store writes exhausted, room is read-only"
            );
        }
        error.into()
    }

    async fn enter_room(
        &self,
        session_id: Uuid,
        club_id: Uuid,
        room_id: Uuid,
    ) -> Result<RoomSnapshot, SyncError> {
        let view = self.session(session_id).await?;
        let identity = view.handle.identity.clone();
        let user_id = identity.user_id;

        // Nothing below may change state until the target is known good.
        if !self.inner.authorizer.can_join_room(user_id, room_id).await {
            return Err(SyncError::Authorization("not a member of this room".into()));
        }
        let room = self
            .inner
            .registry
            .get_or_load(room_id, self.inner.store.as_ref(), self.inner.settings.recent_window)
            .await?;
        if room.club_id != club_id {
            drop(room);
            self.inner.registry.evict_if_idle(room_id).await;
            return Err(SyncError::NotFound("room"));
        }

        // A switch holds both rooms at once so the user is never observed
        // absent from both.
        let previous = view.active_room().filter(|previous| *previous != room_id);
        let (mut state, previous_state) = match previous {
            Some(previous) => self.lock_for_switch(room_id, previous).await?,
            None => (self.lock_live_room(room_id).await?, None),
        };

        let now = Utc::now();
        state.members.insert(session_id, view.handle.clone());
        match state.presence.attach(&identity, session_id, now) {
            AttachOutcome::Joined => {
                let frame = ServerFrame::UserJoined { room_id, user: identity.clone() };
                fan_out(&state.members, &frame, Delivery::Reliable, Audience::ExceptSession(session_id));
            }
            AttachOutcome::Reclaimed => {
                self.inner.reconnect.reclaim(user_id, room_id);
                info!(user_id = %user_id, room_id = %room_id, "presence reclaimed within grace");
            }
            AttachOutcome::AlreadyPresent => {}
        }
        if let Some(mut previous_state) = previous_state {
            self.detach_session(&mut previous_state, session_id, user_id, false);
        }

        self.inner.sessions.set_focus(session_id, club_id, Some(Focus::Room(room_id))).await;
        // Joining counts as an explicit view of the room.
        let last_read_at = self.inner.unread.view(user_id, club_id, Focus::Room(room_id), now).await;
        let unread = self.inner.unread.summary(user_id, club_id).await;
        let snapshot = snapshot(&state, last_read_at, unread);
        drop(state);

        if let Some(previous) = previous {
            self.inner.registry.evict_if_idle(previous).await;
        }
        Ok(snapshot)
    }

    /// Locks the target and the previous room in room id order.
    async fn lock_for_switch(
        &self,
        target: Uuid,
        previous: Uuid,
    ) -> Result<(OwnedMutexGuard<RoomState>, Option<OwnedMutexGuard<RoomState>>), SyncError> {
        loop {
            let target_room = self
                .inner
                .registry
                .get_or_load(target, self.inner.store.as_ref(), self.inner.settings.recent_window)
                .await?;
            let (target_state, previous_state) = match self.inner.registry.get(previous).await {
                None => (Arc::clone(&target_room.state).lock_owned().await, None),
                Some(previous_room) if previous < target => {
                    let previous_state = Arc::clone(&previous_room.state).lock_owned().await;
                    let target_state = Arc::clone(&target_room.state).lock_owned().await;
                    (target_state, Some(previous_state))
                }
                Some(previous_room) => {
                    let target_state = Arc::clone(&target_room.state).lock_owned().await;
                    let previous_state = Arc::clone(&previous_room.state).lock_owned().await;
                    (target_state, Some(previous_state))
                }
            };
            if target_state.evicted {
                continue;
            }
            return Ok((target_state, previous_state.filter(|state| !state.evicted)));
        }
    }

    async fn leave_room(&self, session_id: Uuid, user_id: Uuid, room_id: Uuid, linger: bool) {
        let Some(room) = self.inner.registry.get(room_id).await else {
            return;
        };
        let mut state = room.state.lock().await;
        if state.evicted {
            return;
        }
        self.detach_session(&mut state, session_id, user_id, linger);
        drop(state);
        self.inner.registry.evict_if_idle(room_id).await;
    }

    /// Removes one session from a locked room. `linger` holds the user's
    /// presence when this was their last session there.
    fn detach_session(&self, state: &mut RoomState, session_id: Uuid, user_id: Uuid, linger: bool) {
        let room_id = state.room_id();
        state.members.remove(&session_id);

        let outcome = if linger && state.presence.is_last_session(user_id, session_id) {
            let generation = self.inner.reconnect.begin_linger(user_id, room_id);
            let outcome = state.presence.detach_with_hold(user_id, session_id, generation);
            self.spawn_linger_expiry(room_id, user_id, generation);
            outcome
        } else {
            state.presence.detach(user_id, session_id)
        };

        match outcome {
            DetachOutcome::Left => announce_leave(state, user_id),
            DetachOutcome::Held => {
                info!(user_id = %user_id, room_id = %room_id, "holding presence for reconnect");
            }
            DetachOutcome::StillPresent | DetachOutcome::Unknown => {}
        }
    }

    fn spawn_linger_expiry(&self, room_id: Uuid, user_id: Uuid, generation: u64) {
        let hub = self.clone();
        let grace = self.inner.settings.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.expire_linger(room_id, user_id, generation).await;
        });
    }

    async fn expire_linger(&self, room_id: Uuid, user_id: Uuid, generation: u64) {
        if !self.inner.reconnect.finish_linger(user_id, room_id, generation) {
            return;
        }
        let Some(room) = self.inner.registry.get(room_id).await else {
            return;
        };
        let mut state = room.state.lock().await;
        if state.evicted || !state.presence.release_hold(user_id, generation) {
            return;
        }
        announce_leave(&mut state, user_id);
        metrics::increment_linger_expired();
        info!(user_id = %user_id, room_id = %room_id, "reconnect grace expired");
        drop(state);
        self.inner.registry.evict_if_idle(room_id).await;
    }

    /// Marks the room unread for every club user not looking at it and sends
    /// a hint to their sessions. Runs after the message fan-out, outside the
    /// room lock.
    async fn notify_room_activity(
        &self,
        club_id: Uuid,
        room_id: Uuid,
        actor: Uuid,
        at: DateTime<Utc>,
        member_user_ids: &[Uuid],
    ) {
        let target = Focus::Room(room_id);
        let sessions = self.inner.sessions.in_club(club_id).await;

        let viewing: HashSet<Uuid> = sessions
            .iter()
            .filter(|view| view.focus.as_ref() == Some(&target))
            .map(|view| view.handle.user_id())
            .collect();
        let candidates: HashSet<Uuid> = sessions
            .iter()
            .map(|view| view.handle.user_id())
            .chain(member_user_ids.iter().copied())
            .filter(|user_id| *user_id != actor && !viewing.contains(user_id))
            .collect();

        let mut allowed = HashMap::with_capacity(candidates.len());
        for user_id in candidates {
            let can_join = self.inner.authorizer.can_join_room(user_id, room_id).await;
            allowed.insert(user_id, can_join);
            if can_join {
                self.inner.unread.notify(user_id, club_id, target.clone(), at).await;
            }
        }

        let frame = ServerFrame::RoomActivity { room_id };
        for view in &sessions {
            if allowed.get(&view.handle.user_id()).copied().unwrap_or(false) {
                deliver(&view.handle, frame.clone(), Delivery::BestEffort);
            }
        }
    }
}

fn announce_leave(state: &mut RoomState, user_id: Uuid) {
    if let Some(document) = state.document.as_mut() {
        document.remove_cursor(user_id);
    }
    let frame = ServerFrame::UserLeft { room_id: state.room_id(), user_id };
    fan_out(&state.members, &frame, Delivery::Reliable, Audience::All);
}

fn snapshot(
    state: &RoomState,
    last_read_at: Option<DateTime<Utc>>,
    unread: UnreadSummary,
) -> RoomSnapshot {
    let (messages, has_more) = match state.kind() {
        RoomKind::Chat => (state.chat.window(), state.chat.has_more()),
        RoomKind::Editor => (Vec::new(), false),
    };
    let document = state.document.as_ref();

    RoomSnapshot {
        room_id: state.room_id(),
        kind: state.kind(),
        messages,
        has_more,
        last_read_at,
        document_text: document.map(|document| document.doc.text.clone()),
        revision: document.map(|document| document.doc.revision),
        cursors: document.map(|document| document.cursor_entries()).unwrap_or_default(),
        presence: state.presence.users(),
        members: state.info.member_user_ids.clone(),
        unread_room_ids: unread.room_ids,
        unread_sections: unread.sections,
    }
}
