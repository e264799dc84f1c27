//! Transient user notifications ("toasts")

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
}

struct Current {
    message: String,
    shown_at: Instant,
}

/// One notification per surfaced error, auto-cleared after `lifetime`.
#[derive(Clone)]
pub struct NotificationCenter {
    tx: broadcast::Sender<Notice>,
    current: Arc<Mutex<Option<Current>>>,
    lifetime: Duration,
}

impl NotificationCenter {
    pub fn new(lifetime: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            current: Arc::new(Mutex::new(None)),
            lifetime,
        }
    }

    pub fn notify(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "Notification");
        if let Ok(mut current) = self.current.lock() {
            *current = Some(Current {
                message: message.clone(),
                shown_at: Instant::now(),
            });
        }
        // No subscribers is fine; the message stays readable via `current`.
        let _ = self.tx.send(Notice { message });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// The visible notification, if it has not expired.
    pub fn current(&self) -> Option<String> {
        let mut current = self.current.lock().ok()?;
        if current
            .as_ref()
            .is_some_and(|c| c.shown_at.elapsed() > self.lifetime)
        {
            *current = None;
        }
        current.as_ref().map(|c| c.message.clone())
    }

    pub fn dismiss(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}
