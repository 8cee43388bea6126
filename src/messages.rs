//! Status messages from the controller and its capture thread.
//!
//! Emission never blocks: messages go into a bounded channel with `try_send`
//! and are dropped (and logged at debug) when the consumer falls behind.
//! Delivery happens on the consumer's thread, either by polling
//! `MessageQueue::try_next` or through a callback driven by
//! `MiniScope::dispatch_messages`.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Messages kept before new ones are discarded.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1024;

/// Consumer callback for status messages.
pub type MessageCallback = Box<dyn FnMut(&str) + Send>;

pub struct MessageQueue {
    tx: SyncSender<String>,
    rx: Mutex<Receiver<String>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::with_capacity(MESSAGE_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = sync_channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue a message for the consumer and mirror it to the log.
    pub fn emit(&self, msg: impl Into<String>) {
        let msg = msg.into();
        log::info!("MiniScope: {}", msg);
        self.enqueue(msg);
    }

    /// Like `emit`, logged as an error.
    pub fn emit_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        log::error!("MiniScope: {}", msg);
        self.enqueue(msg);
    }

    fn enqueue(&self, msg: String) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                log::debug!("message queue full, dropping: {}", msg);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Next pending message, if any. Never blocks on an empty queue.
    pub fn try_next(&self) -> Option<String> {
        self.rx.lock().ok()?.try_recv().ok()
    }

    /// Take every pending message.
    pub fn drain(&self) -> Vec<String> {
        let Ok(rx) = self.rx.lock() else {
            return Vec::new();
        };
        rx.try_iter().collect()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
