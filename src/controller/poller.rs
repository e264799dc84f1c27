//! Periodic player state polling
//!
//! Every tick fetches a fresh snapshot on its own task so a slow request never
//! holds up the next tick. Results come back into the engine as
//! [`EngineEvent::PollResult`] and are dropped when they belong to an older
//! polling run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::EngineEvent;
use crate::device::RemoteDevice;
use crate::model::PlayerStateSnapshot;

pub struct StatePoller {
    interval: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
    snapshot: watch::Sender<Option<PlayerStateSnapshot>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl StatePoller {
    pub fn new(interval: Duration, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            interval,
            generation: 0,
            task: None,
            snapshot: watch::channel(None).0,
            events,
        }
    }

    /// Begin polling `device`. Restarting replaces any earlier run.
    ///
    /// Each request is tagged with the value of `play_epoch` at the moment it
    /// was sent, so the sequencer can tell a result that predates its latest
    /// command.
    pub fn start(&mut self, device: Arc<dyn RemoteDevice>, play_epoch: watch::Receiver<u64>) {
        self.stop();
        let push = device.subscribe_state();
        let generation = self.generation;
        let period = self.interval;
        let events = self.events.clone();
        tracing::debug!(
            interval_ms = period.as_millis() as u64,
            push,
            "State polling started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if events.is_closed() {
                    break;
                }
                let observed_epoch = *play_epoch.borrow();
                let fetch = device.player_state();
                let events = events.clone();
                tokio::spawn(async move {
                    let result = fetch.await.map_err(|e| e.to_string());
                    let _ = events.send(EngineEvent::PollResult {
                        generation,
                        play_epoch: observed_epoch,
                        result,
                    });
                });
            }
        }));
    }

    pub fn stop(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("State polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Apply a poll result. Returns the snapshot that should be forwarded to
    /// the sequencer, if any.
    pub fn on_poll_result(
        &mut self,
        generation: u64,
        result: Result<Option<PlayerStateSnapshot>, String>,
    ) -> Option<PlayerStateSnapshot> {
        if generation != self.generation || self.task.is_none() {
            return None;
        }
        match result {
            Ok(Some(snapshot)) => {
                self.snapshot.send_replace(Some(snapshot.clone()));
                Some(snapshot)
            }
            Ok(None) => {
                tracing::trace!("Poll returned no active playback");
                None
            }
            Err(e) => {
                // A failed tick is skipped; the next one tries again.
                tracing::debug!(error = %e, "Poll failed");
                None
            }
        }
    }

    /// Apply a pushed snapshot from the device.
    pub fn on_push(&mut self, snapshot: PlayerStateSnapshot) -> PlayerStateSnapshot {
        self.snapshot.send_replace(Some(snapshot.clone()));
        snapshot
    }

    pub fn current_snapshot(&self) -> Option<PlayerStateSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PlayerStateSnapshot>> {
        self.snapshot.subscribe()
    }
}

impl Drop for StatePoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeDevice;

    fn snapshot(position_ms: u64) -> PlayerStateSnapshot {
        PlayerStateSnapshot {
            track_uri: Some("spotify:track:a".into()),
            position_ms,
            duration_ms: 180_000,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let device = FakeDevice::new();
        device.set_state(Some(snapshot(1_000)));
        let mut poller = StatePoller::new(Duration::from_millis(500), tx);
        let (epoch_tx, epoch_rx) = watch::channel(7);
        poller.start(Arc::new(device.clone()), epoch_rx);

        let mut received = 0;
        while received < 3 {
            match rx.recv().await {
                Some(EngineEvent::PollResult {
                    generation,
                    play_epoch,
                    result,
                }) => {
                    assert_eq!(play_epoch, *epoch_tx.borrow());
                    let forwarded = poller.on_poll_result(generation, result);
                    assert_eq!(forwarded, Some(snapshot(1_000)));
                    received += 1;
                }
                _ => panic!("expected poll result"),
            }
        }
        assert_eq!(poller.current_snapshot(), Some(snapshot(1_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_carry_epoch_at_send_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let device = FakeDevice::new();
        let mut poller = StatePoller::new(Duration::from_millis(500), tx);
        let (epoch_tx, epoch_rx) = watch::channel(1);
        poller.start(Arc::new(device), epoch_rx);

        let first = match rx.recv().await {
            Some(EngineEvent::PollResult { play_epoch, .. }) => play_epoch,
            _ => panic!("expected poll result"),
        };
        epoch_tx.send_replace(2);
        let second = match rx.recv().await {
            Some(EngineEvent::PollResult { play_epoch, .. }) => play_epoch,
            _ => panic!("expected poll result"),
        };
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn push_replaces_current_snapshot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut poller = StatePoller::new(Duration::from_millis(500), tx);
        poller.start(Arc::new(FakeDevice::new()), watch::channel(0).1);
        let generation = poller.generation;
        poller.on_poll_result(generation, Ok(Some(snapshot(1_000))));

        let pushed = poller.on_push(snapshot(4_000));
        assert_eq!(pushed, snapshot(4_000));
        assert_eq!(poller.current_snapshot(), Some(snapshot(4_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_skipped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut poller = StatePoller::new(Duration::from_millis(500), tx);
        poller.start(Arc::new(FakeDevice::new()), watch::channel(0).1);
        let generation = poller.generation;

        poller.on_poll_result(generation, Ok(Some(snapshot(1_000))));
        assert_eq!(
            poller.on_poll_result(generation, Err("connection reset".into())),
            None
        );
        assert_eq!(poller.current_snapshot(), Some(snapshot(1_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn results_from_stopped_run_are_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut poller = StatePoller::new(Duration::from_millis(500), tx);
        poller.start(Arc::new(FakeDevice::new()), watch::channel(0).1);
        let stale = poller.generation;
        poller.stop();

        assert_eq!(poller.on_poll_result(stale, Ok(Some(snapshot(5)))), None);
        assert_eq!(poller.current_snapshot(), None);
        assert!(!poller.is_running());
    }
}
