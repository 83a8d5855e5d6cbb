// Contracts for the collaborators the room engine depends on but never
// embeds: durable room storage and room authorization.

pub mod authz;
pub mod memory;
pub mod retry;
pub mod store;

pub use authz::{MemberListAuthorizer, RoomAuthorizer};
pub use memory::MemoryRoomStore;
pub use retry::{with_retry, RetryPolicy};
pub use store::{RoomStore, StoreError};
