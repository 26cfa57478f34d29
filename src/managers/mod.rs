// Managers Module
//
// Each manager handles one specific concern:
// - SessionController: record / save / process session lifecycle
// - EventBroadcaster: listener registry and event fan-out

pub mod broadcast_manager;
pub mod session_manager;

pub use broadcast_manager::{EventBroadcaster, EventStream, ListenerId};
pub use session_manager::SessionController;
