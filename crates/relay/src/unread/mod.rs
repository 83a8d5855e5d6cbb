// Per-user unread watermarks for rooms and sections.
//
// A mark keeps two timestamps: the last acknowledged view and the latest
// activity. Both only move forward, so concurrent `view` and `notify` calls
// settle to the same state whatever order they are applied in.

use std::collections::HashMap;

use bookclub_common::link::Focus;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadMark {
    pub last_acknowledged_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl UnreadMark {
    pub fn is_unread(&self) -> bool {
        match (self.last_activity_at, self.last_acknowledged_at) {
            (Some(activity), Some(acknowledged)) => activity > acknowledged,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Unread rooms and sections for one user within one club.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSummary {
    pub room_ids: Vec<Uuid>,
    pub sections: Vec<String>,
}

type MarkKey = (Uuid, Focus);

#[derive(Debug, Default)]
pub struct UnreadLedger {
    marks: RwLock<HashMap<Uuid, HashMap<MarkKey, UnreadMark>>>,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an explicit view. Returns the acknowledgement that was in
    /// place before this call.
    pub async fn view(
        &self,
        user_id: Uuid,
        club_id: Uuid,
        target: Focus,
        at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut guard = self.marks.write().await;
        let mark = guard.entry(user_id).or_default().entry((club_id, target)).or_default();
        let previous = mark.last_acknowledged_at;
        mark.last_acknowledged_at = Some(previous.map_or(at, |current| current.max(at)));
        previous
    }

    pub async fn notify(&self, user_id: Uuid, club_id: Uuid, target: Focus, at: DateTime<Utc>) {
        let mut guard = self.marks.write().await;
        let mark = guard.entry(user_id).or_default().entry((club_id, target)).or_default();
        mark.last_activity_at = Some(mark.last_activity_at.map_or(at, |current| current.max(at)));
    }

    pub async fn mark(&self, user_id: Uuid, club_id: Uuid, target: &Focus) -> UnreadMark {
        let guard = self.marks.read().await;
        guard
            .get(&user_id)
            .and_then(|marks| marks.get(&(club_id, target.clone())))
            .copied()
            .unwrap_or_default()
    }

    pub async fn is_unread(&self, user_id: Uuid, club_id: Uuid, target: &Focus) -> bool {
        self.mark(user_id, club_id, target).await.is_unread()
    }

    pub async fn summary(&self, user_id: Uuid, club_id: Uuid) -> UnreadSummary {
        let guard = self.marks.read().await;
        let mut summary = UnreadSummary::default();
        let Some(marks) = guard.get(&user_id) else {
            return summary;
        };

        for ((mark_club, target), mark) in marks {
            if *mark_club != club_id || !mark.is_unread() {
                continue;
            }
            match target {
                Focus::Room(room_id) => summary.room_ids.push(*room_id),
                Focus::Section(section) => summary.sections.push(section.clone()),
            }
        }
        summary.room_ids.sort();
        summary.sections.sort();
        summary
    }
}
