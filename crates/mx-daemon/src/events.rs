use std::sync::{Arc, Mutex};

use mx_core::types::MatrixMessage;

/// A broadcast-style event bus for inbound messages, built on flume
/// channels.
///
/// Each `subscribe` call creates a receiver that sees every message
/// published afterwards; disconnected subscribers are pruned on publish.
/// Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Arc<MatrixMessage>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<Arc<MatrixMessage>> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    pub fn publish(&self, message: Arc<MatrixMessage>) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
