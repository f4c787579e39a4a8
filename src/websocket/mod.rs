pub mod events;
pub mod session;

pub use events::{EventType, PushFrame};
pub use session::ws_handler;
