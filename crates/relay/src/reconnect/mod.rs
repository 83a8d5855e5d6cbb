// Server-side reconnection coordination.
//
// When a user's last session in a room drops abnormally, their presence is
// held for one grace window instead of being removed. The coordinator hands
// out the generation that tags each hold and decides whether an expiring
// timer still owns it. Timers themselves are spawned by the room hub.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bookclub_common::link::{CloseKind, Focus};
use tokio::time::Instant;
use uuid::Uuid;

/// What to do with a session's room membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Membership stays as is.
    Keep,
    /// Remove membership now and announce the leave.
    Immediate,
    /// Remove the session but hold presence for a reconnect.
    Linger,
}

/// Membership teardown as a function of transport liveness, the desired
/// focus and how the transport closed. `close` is `None` while the transport
/// is alive.
pub fn teardown_for(
    transport_alive: bool,
    desired: Option<&Focus>,
    close: Option<CloseKind>,
) -> Teardown {
    let wants_room = matches!(desired, Some(Focus::Room(_)));
    match (transport_alive, wants_room, close) {
        (true, true, _) => Teardown::Keep,
        // Navigated to a section or out of the club; the socket stays up.
        (true, false, _) => Teardown::Immediate,
        (false, true, Some(CloseKind::Abnormal)) => Teardown::Linger,
        (false, _, _) => Teardown::Immediate,
    }
}

/// Per-user link state as seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// No live session, reconnect expected until `deadline`.
    Connecting { deadline: Instant },
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct Linger {
    generation: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    sessions: HashMap<Uuid, usize>,
    lingering: HashMap<(Uuid, Uuid), Linger>,
}

#[derive(Debug)]
pub struct ReconnectCoordinator {
    grace: Duration,
    next_generation: AtomicU64,
    state: Mutex<CoordinatorState>,
}

impl ReconnectCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            next_generation: AtomicU64::new(1),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_opened(&self, user_id: Uuid) {
        *self.lock().sessions.entry(user_id).or_insert(0) += 1;
    }

    pub fn session_closed(&self, user_id: Uuid) {
        let mut state = self.lock();
        if let Some(count) = state.sessions.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.sessions.remove(&user_id);
            }
        }
    }

    /// Arms a linger for `user_id` in `room_id` and returns its generation.
    /// A newer linger supersedes an older one for the same room.
    pub fn begin_linger(&self, user_id: Uuid, room_id: Uuid) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + self.grace;
        self.lock().lingering.insert((user_id, room_id), Linger { generation, deadline });
        generation
    }

    /// The user is back in the room before the grace window closed.
    pub fn reclaim(&self, user_id: Uuid, room_id: Uuid) -> bool {
        self.lock().lingering.remove(&(user_id, room_id)).is_some()
    }

    /// Called by the expiry timer. Returns `true` when `generation` still owns
    /// the linger, in which case the hold must be released.
    pub fn finish_linger(&self, user_id: Uuid, room_id: Uuid, generation: u64) -> bool {
        let mut state = self.lock();
        match state.lingering.get(&(user_id, room_id)) {
            Some(linger) if linger.generation == generation => {
                state.lingering.remove(&(user_id, room_id));
                true
            }
            _ => false,
        }
    }

    pub fn link_state(&self, user_id: Uuid) -> LinkState {
        let state = self.lock();
        if state.sessions.get(&user_id).is_some_and(|count| *count > 0) {
            return LinkState::Connected;
        }
        state
            .lingering
            .iter()
            .filter(|((user, _), _)| *user == user_id)
            .map(|(_, linger)| linger.deadline)
            .max()
            .map_or(LinkState::Disconnected, |deadline| LinkState::Connecting { deadline })
    }

    pub fn lingering_count(&self) -> usize {
        self.lock().lingering.len()
    }
}
