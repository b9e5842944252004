//! Matrix client/daemon: durable outbound delivery to the hub and the local
//! surface (SSE stream, status, auth-reset) for in-workspace consumers.

pub mod daemon;
pub mod events;
pub mod hub_client;
pub mod local_api;
pub mod outbound;
pub mod state;

pub use daemon::Daemon;
pub use events::EventBus;
pub use outbound::enqueue;
pub use state::{AuthState, DaemonShared, Shared, MAX_AUTH_FAILURES};
