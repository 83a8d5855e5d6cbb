use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::store::{RoomStore, StoreError};

#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    async fn can_join_room(&self, user_id: Uuid, room_id: Uuid) -> bool;

    /// Whether the user belongs to the club at all, which gates its sections
    /// and section activity.
    async fn can_view_club(&self, user_id: Uuid, club_id: Uuid) -> bool;
}

/// Authorizes against the room's member list. A room without a member list
/// is open to every admitted user. A user belongs to a club when they may
/// join at least one of its rooms. Lookup failures deny.
pub struct MemberListAuthorizer {
    store: Arc<dyn RoomStore>,
}

impl MemberListAuthorizer {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RoomAuthorizer for MemberListAuthorizer {
    async fn can_join_room(&self, user_id: Uuid, room_id: Uuid) -> bool {
        match self.store.load_room(room_id).await {
            Ok(room) => room.member_user_ids.is_empty() || room.member_user_ids.contains(&user_id),
            Err(StoreError::NotFound(_)) => false,
            Err(error) => {
                warn!(error = %error, user_id = %user_id, room_id = %room_id, "room authorization lookup failed");
                false
            }
        }
    }

    async fn can_view_club(&self, user_id: Uuid, club_id: Uuid) -> bool {
        match self.store.list_club_rooms(club_id).await {
            Ok(rooms) => rooms.iter().any(|room| {
                room.member_user_ids.is_empty() || room.member_user_ids.contains(&user_id)
            }),
            Err(error) => {
                warn!(error = %error, user_id = %user_id, club_id = %club_id, "club authorization lookup failed");
                false
            }
        }
    }
}
