// Presence set for a single room: a set over users, derived from the
// sessions attached to the room.
//
// Lives inside the room's state and is only touched under the room lock.

use std::collections::{HashMap, HashSet};

use bookclub_common::types::UserIdentity;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PresenceEntry {
    identity: UserIdentity,
    joined_at: DateTime<Utc>,
    sessions: HashSet<Uuid>,
    /// Linger generation while the user's last session is gone but a
    /// reconnect is still expected.
    hold: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// User was absent; a join must be announced.
    Joined,
    /// User was held by a linger and is back before it expired.
    Reclaimed,
    /// User already had another session in the room.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// User still has other sessions in the room.
    StillPresent,
    /// User's last session left; a leave must be announced.
    Left,
    /// User's last session left but presence is held for a reconnect.
    Held,
    /// Session was not attached.
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceSet {
    pub fn attach(
        &mut self,
        identity: &UserIdentity,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> AttachOutcome {
        match self.entries.get_mut(&identity.user_id) {
            Some(entry) => {
                let reclaimed = entry.sessions.is_empty() && entry.hold.take().is_some();
                entry.sessions.insert(session_id);
                entry.identity = identity.clone();
                if reclaimed {
                    AttachOutcome::Reclaimed
                } else {
                    AttachOutcome::AlreadyPresent
                }
            }
            None => {
                self.entries.insert(
                    identity.user_id,
                    PresenceEntry {
                        identity: identity.clone(),
                        joined_at: at,
                        sessions: HashSet::from([session_id]),
                        hold: None,
                    },
                );
                AttachOutcome::Joined
            }
        }
    }

    pub fn detach(&mut self, user_id: Uuid, session_id: Uuid) -> DetachOutcome {
        self.detach_inner(user_id, session_id, None)
    }

    /// Like `detach`, but keeps the user present under `generation` when this
    /// was their last session.
    pub fn detach_with_hold(
        &mut self,
        user_id: Uuid,
        session_id: Uuid,
        generation: u64,
    ) -> DetachOutcome {
        self.detach_inner(user_id, session_id, Some(generation))
    }

    fn detach_inner(
        &mut self,
        user_id: Uuid,
        session_id: Uuid,
        hold: Option<u64>,
    ) -> DetachOutcome {
        let Some(entry) = self.entries.get_mut(&user_id) else {
            return DetachOutcome::Unknown;
        };
        if !entry.sessions.remove(&session_id) {
            return DetachOutcome::Unknown;
        }
        if !entry.sessions.is_empty() {
            return DetachOutcome::StillPresent;
        }
        match hold {
            Some(generation) => {
                entry.hold = Some(generation);
                DetachOutcome::Held
            }
            None => {
                self.entries.remove(&user_id);
                DetachOutcome::Left
            }
        }
    }

    /// Drops a held user if `generation` is still the current hold and no
    /// session came back. Returns `true` when the user left.
    pub fn release_hold(&mut self, user_id: Uuid, generation: u64) -> bool {
        let expired = self
            .entries
            .get(&user_id)
            .is_some_and(|entry| entry.sessions.is_empty() && entry.hold == Some(generation));
        if expired {
            self.entries.remove(&user_id);
        }
        expired
    }

    pub fn is_last_session(&self, user_id: Uuid, session_id: Uuid) -> bool {
        self.entries
            .get(&user_id)
            .is_some_and(|entry| entry.sessions.len() == 1 && entry.sessions.contains(&session_id))
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.entries.contains_key(&user_id)
    }

    pub fn has_holds(&self) -> bool {
        self.entries.values().any(|entry| entry.hold.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Present users, earliest joiner first.
    pub fn users(&self) -> Vec<UserIdentity> {
        let mut entries: Vec<&PresenceEntry> = self.entries.values().collect();
        entries.sort_by(|left, right| {
            left.joined_at
                .cmp(&right.joined_at)
                .then_with(|| left.identity.user_id.cmp(&right.identity.user_id))
        });
        entries.into_iter().map(|entry| entry.identity.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: u128) -> UserIdentity {
        UserIdentity {
            user_id: Uuid::from_u128(n),
            display_name: format!("reader-{n}"),
            avatar_ref: None,
        }
    }

    fn session(n: u128) -> Uuid {
        Uuid::from_u128(10_000 + n)
    }

    #[test]
    fn second_tab_does_not_duplicate_presence() {
        let mut presence = PresenceSet::default();
        let now = Utc::now();
        assert_eq!(presence.attach(&identity(1), session(1), now), AttachOutcome::Joined);
        assert_eq!(presence.attach(&identity(1), session(2), now), AttachOutcome::AlreadyPresent);
        assert_eq!(presence.users().len(), 1);

        assert_eq!(presence.detach(identity(1).user_id, session(1)), DetachOutcome::StillPresent);
        assert!(presence.contains(identity(1).user_id));
        assert_eq!(presence.detach(identity(1).user_id, session(2)), DetachOutcome::Left);
        assert!(presence.is_empty());
    }

    #[test]
    fn held_user_is_reclaimed_silently() {
        let mut presence = PresenceSet::default();
        let user = identity(1);
        presence.attach(&user, session(1), Utc::now());

        assert_eq!(presence.detach_with_hold(user.user_id, session(1), 7), DetachOutcome::Held);
        assert!(presence.contains(user.user_id));
        assert!(presence.has_holds());

        assert_eq!(presence.attach(&user, session(2), Utc::now()), AttachOutcome::Reclaimed);
        assert!(!presence.has_holds());
        assert!(!presence.release_hold(user.user_id, 7));
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn stale_generation_does_not_release_newer_hold() {
        let mut presence = PresenceSet::default();
        let user = identity(1);
        presence.attach(&user, session(1), Utc::now());
        presence.detach_with_hold(user.user_id, session(1), 1);
        presence.attach(&user, session(2), Utc::now());
        presence.detach_with_hold(user.user_id, session(2), 2);

        assert!(!presence.release_hold(user.user_id, 1));
        assert!(presence.release_hold(user.user_id, 2));
        assert!(presence.is_empty());
    }

    #[test]
    fn hold_only_applies_to_last_session() {
        let mut presence = PresenceSet::default();
        let user = identity(1);
        presence.attach(&user, session(1), Utc::now());
        presence.attach(&user, session(2), Utc::now());

        assert!(!presence.is_last_session(user.user_id, session(1)));
        assert_eq!(
            presence.detach_with_hold(user.user_id, session(1), 3),
            DetachOutcome::StillPresent
        );
        assert!(!presence.has_holds());
        assert!(presence.is_last_session(user.user_id, session(2)));
    }

    #[test]
    fn detaching_unknown_session_is_reported() {
        let mut presence = PresenceSet::default();
        presence.attach(&identity(1), session(1), Utc::now());
        assert_eq!(presence.detach(identity(1).user_id, session(9)), DetachOutcome::Unknown);
        assert_eq!(presence.detach(identity(2).user_id, session(1)), DetachOutcome::Unknown);
    }

    #[test]
    fn users_are_ordered_by_join_time() {
        let mut presence = PresenceSet::default();
        let base = Utc::now();
        presence.attach(&identity(2), session(2), base + chrono::Duration::seconds(1));
        presence.attach(&identity(1), session(1), base + chrono::Duration::seconds(2));
        let ids: Vec<Uuid> = presence.users().into_iter().map(|u| u.user_id).collect();
        assert_eq!(ids, vec![identity(2).user_id, identity(1).user_id]);
    }
}
