// WebSocket surface: admission, the per-connection socket loop and the
// session table shared with the room engine.

pub mod handler;
pub mod protocol;
pub mod session;


pub use handler::{router, WsState};
pub use session::{SessionHandle, SessionStore, SessionView};
