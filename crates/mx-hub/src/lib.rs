//! Matrix hub: authenticated WebSocket fabric with presence, heartbeat,
//! broadcast, and direct messaging.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{PinMode, TokenBook, TOKEN_GRACE};
pub use protocol::{ClientFrame, ServerFrame, ERR_DELIVERY_FAILED, ERR_INVALID_MESSAGE};
pub use server::{router, spawn_heartbeat, HubState, HEARTBEAT_INTERVAL, IDLE_TIMEOUT};
