//! Shared daemon state: connection status, auth failure tracking, and the
//! channels that tie the task set together.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mx_store::Store;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::events::EventBus;

/// Consecutive auth failures before the daemon stops retrying and waits for
/// an operator `/auth-reset`.
pub const MAX_AUTH_FAILURES: u32 = 3;

/// A frame handed to the connection task for transmit, with an ack channel
/// reporting whether the socket write succeeded.
pub type OutboundFrame = (String, oneshot::Sender<Result<(), String>>);

pub struct DaemonShared {
    pub store: Store,
    pub matrix_id: String,
    pub display_name: String,
    /// `http://host:port` of the hub.
    pub hub_url: String,
    pub events: EventBus,
    pub connected: AtomicBool,
    pub auth: AuthState,
    /// Wakes the connection loop out of its auth-stopped or backoff wait.
    pub reconnect: Notify,
    /// Wakes the outbound worker immediately after an enqueue.
    pub kick: Notify,
    /// Transmit channel into the connection task.
    pub out_tx: mpsc::Sender<OutboundFrame>,
}

impl DaemonShared {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

/// Authentication failure tracking surfaced on `/status` and reset via
/// `/auth-reset`.
pub struct AuthState {
    pin: Mutex<Option<String>>,
    failure_count: AtomicU32,
    stopped: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl AuthState {
    pub fn new(pin: Option<String>) -> Self {
        Self {
            pin: Mutex::new(pin),
            failure_count: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn pin(&self) -> Option<String> {
        self.pin.lock().expect("auth lock").clone()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("auth lock").clone()
    }

    /// Record an auth failure; returns true once the stop threshold is hit.
    pub fn record_failure(&self, error: impl Into<String>) -> bool {
        *self.last_error.lock().expect("auth lock") = Some(error.into());
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= MAX_AUTH_FAILURES {
            self.stopped.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *self.last_error.lock().expect("auth lock") = None;
    }

    /// Operator reset: install a (possibly new) PIN and resume connecting.
    pub fn reset(&self, pin: Option<String>) {
        if pin.is_some() {
            *self.pin.lock().expect("auth lock") = pin;
        }
        self.failure_count.store(0, Ordering::Relaxed);
        self.stopped.store(false, Ordering::Relaxed);
        *self.last_error.lock().expect("auth lock") = None;
    }
}

/// Bundle shared by every daemon task.
pub type Shared = Arc<DaemonShared>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_accumulate_to_stop() {
        let auth = AuthState::new(Some("123456".into()));
        assert!(!auth.record_failure("401"));
        assert!(!auth.record_failure("401"));
        assert!(auth.record_failure("401"));
        assert!(auth.is_stopped());
        assert_eq!(auth.failure_count(), 3);
        assert_eq!(auth.last_error().as_deref(), Some("401"));
    }

    #[test]
    fn reset_clears_state_and_installs_pin() {
        let auth = AuthState::new(None);
        auth.record_failure("401");
        auth.reset(Some("777777".into()));
        assert!(!auth.is_stopped());
        assert_eq!(auth.failure_count(), 0);
        assert_eq!(auth.pin().as_deref(), Some("777777"));
        assert!(auth.last_error().is_none());
    }

    #[test]
    fn success_resets_counter_but_keeps_pin() {
        let auth = AuthState::new(Some("1".into()));
        auth.record_failure("401");
        auth.record_success();
        assert_eq!(auth.failure_count(), 0);
        assert_eq!(auth.pin().as_deref(), Some("1"));
    }
}
