use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal — cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator shared by a process's task set.
///
/// Components call `subscribe()` and `select!` on the returned receiver
/// alongside their main loop; the owner calls `trigger()` once and then
/// `wait_for_drain(n, timeout)` for the components that hold a
/// [`ShutdownGuard`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Idempotent.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = *self.drain_rx.borrow();
            if current >= expected {
                info!(count = current, "all components drained");
                return true;
            }
            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.drain_rx.borrow() >= expected,
                Err(_) => {
                    warn!(
                        current = *self.drain_rx.borrow(),
                        expected, "drain timeout, some components did not confirm"
                    );
                    return false;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard — RAII guard that confirms drain on drop
// ---------------------------------------------------------------------------

/// Confirms drain when dropped. Give one to each component that participates
/// in graceful shutdown.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_sets_flag_and_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_receive_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("signal within timeout")
            .expect("channel open");
    }

    #[tokio::test]
    async fn drain_completes_when_all_confirm() {
        let mut signal = ShutdownSignal::new();
        let g1 = ShutdownGuard::new(signal.clone());
        let g2 = ShutdownGuard::new(signal.clone());
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(g1);
            drop(g2);
        });

        assert!(signal.wait_for_drain(2, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn drain_times_out_without_confirmations() {
        let mut signal = ShutdownSignal::new();
        let _held = ShutdownGuard::new(signal.clone());
        signal.trigger();
        assert!(!signal.wait_for_drain(2, Duration::from_millis(50)).await);
    }

    #[test]
    fn clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }
}
