use std::collections::HashMap;

use bookclub_common::protocol::ws::ServerFrame;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use crate::{metrics, ws::session::SessionHandle};

/// How a frame behaves when a session's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Must not be lost. A session that cannot take it is cycled and will
    /// resync from a snapshot on reconnect.
    Reliable,
    /// May be dropped; a later frame supersedes it.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    ExceptSession(Uuid),
}

impl Audience {
    fn includes(self, session_id: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::ExceptSession(excluded) => excluded != session_id,
        }
    }
}

/// Queues `frame` on one session. Returns `false` when the frame did not land.
pub fn deliver(handle: &SessionHandle, frame: ServerFrame, delivery: Delivery) -> bool {
    let kind = frame.kind();
    match handle.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            match delivery {
                Delivery::Reliable => {
                    warn!(
                        session_id = %handle.session_id,
                        user_id = %handle.user_id(),
                        frame = kind,
                        "outbound queue full, cycling session"
                    );
                    metrics::increment_sessions_cycled();
                    handle.kick();
                }
                Delivery::BestEffort => metrics::increment_outbound_dropped(kind),
            }
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Fans `frame` out to every member in `audience`. Callers hold the room lock
/// so all members observe the same order.
pub fn fan_out(
    members: &HashMap<Uuid, SessionHandle>,
    frame: &ServerFrame,
    delivery: Delivery,
    audience: Audience,
) -> usize {
    members
        .iter()
        .filter(|(session_id, _)| audience.includes(**session_id))
        .filter(|(_, handle)| deliver(handle, frame.clone(), delivery))
        .count()
}
