//! Cancellable one-shot timers keyed by a generation counter

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::EngineEvent;

/// Holds at most one pending timer.
///
/// A timer delivers its event back into the engine tagged with the generation
/// it was scheduled under. Scheduling again or cancelling bumps the
/// generation, so an event that was already in flight is recognised as stale
/// by [`TimerSlot::fire`].
#[derive(Default)]
pub struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        delay: Duration,
        events: &mpsc::UnboundedSender<EngineEvent>,
        event: impl FnOnce(u64) -> EngineEvent,
    ) -> u64 {
        self.cancel();
        let generation = self.generation;
        let event = event(generation);
        let tx = events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
        generation
    }

    pub fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Consume a delivered timer event. `false` for stale generations.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new();
        let generation = slot.schedule(Duration::from_secs(2), &tx, |generation| {
            EngineEvent::ReconnectDue { generation }
        });
        assert!(slot.is_pending());

        match rx.recv().await {
            Some(EngineEvent::ReconnectDue { generation: fired }) => {
                assert_eq!(fired, generation);
                assert!(slot.fire(fired));
            }
            _ => panic!("expected reconnect event"),
        }
        assert!(!slot.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_invalidates_previous() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new();
        let first = slot.schedule(Duration::from_secs(2), &tx, |generation| {
            EngineEvent::ReconnectDue { generation }
        });
        let second = slot.schedule(Duration::from_secs(2), &tx, |generation| {
            EngineEvent::ReconnectDue { generation }
        });
        assert_ne!(first, second);
        assert!(!slot.fire(first));
        assert!(slot.fire(second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimerSlot::new();
        slot.schedule(Duration::from_millis(500), &tx, |generation| {
            EngineEvent::ReconnectDue { generation }
        });
        slot.cancel();
        drop(tx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.recv().await.is_none());
    }
}
