use bookclub_common::types::ChatMessage;
use chrono::{DateTime, Duration, Utc};

/// Position of an accepted message in its room's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-room acceptance order. `seq` increases by one per accepted message and
/// `created_at` strictly increases, so "strictly before T" pages are exact.
#[derive(Debug, Clone, Default)]
pub struct RoomSequencer {
    last: Option<Stamp>,
}

impl RoomSequencer {
    /// Seeds from persisted history so a re-hydrated room continues its order.
    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        let last = messages
            .iter()
            .map(|message| Stamp { seq: message.seq, created_at: message.created_at })
            .reduce(|left, right| Stamp {
                seq: left.seq.max(right.seq),
                created_at: left.created_at.max(right.created_at),
            });
        Self { last }
    }

    /// Stamp the next message would receive. Nothing is consumed until
    /// `accept`, so a failed write leaves no gap.
    pub fn propose(&self, now: DateTime<Utc>) -> Stamp {
        match self.last {
            None => Stamp { seq: 1, created_at: now },
            Some(last) => {
                let created_at = if now > last.created_at {
                    now
                } else {
                    last.created_at + Duration::microseconds(1)
                };
                Stamp { seq: last.seq + 1, created_at }
            }
        }
    }

    pub fn accept(&mut self, stamp: Stamp) {
        if self.last.map_or(true, |last| stamp.seq > last.seq) {
            self.last = Some(stamp);
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last.map_or(0, |last| last.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_timestamps_are_nudged_forward() {
        let mut sequencer = RoomSequencer::default();
        let now = Utc::now();

        let first = sequencer.propose(now);
        sequencer.accept(first);
        let second = sequencer.propose(now);
        sequencer.accept(second);
        let third = sequencer.propose(now - Duration::seconds(1));

        assert_eq!((first.seq, second.seq, third.seq), (1, 2, 3));
        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);
    }

    #[test]
    fn proposal_without_accept_does_not_advance() {
        let sequencer = RoomSequencer::default();
        let now = Utc::now();
        assert_eq!(sequencer.propose(now), sequencer.propose(now));
        assert_eq!(sequencer.last_seq(), 0);
    }

    #[test]
    fn seeding_continues_persisted_order() {
        let now = Utc::now();
        let message = ChatMessage {
            id: uuid::Uuid::from_u128(1),
            room_id: uuid::Uuid::from_u128(2),
            seq: 41,
            author_id: uuid::Uuid::from_u128(3),
            body: "hi".into(),
            created_at: now,
            edited_at: None,
            deleted_at: None,
            is_system: false,
            attachments: Vec::new(),
            reactions: Vec::new(),
            reply_to_id: None,
        };
        let sequencer = RoomSequencer::from_messages(&[message]);
        let next = sequencer.propose(now);
        assert_eq!(next.seq, 42);
        assert!(next.created_at > now);
    }
}
