//! Controller module - the session engine
//!
//! One actor owns the session, the poller and the sequencer. Everything that
//! mutates them arrives as an [`EngineEvent`] on a single channel: user
//! commands from [`EngineHandle`], device callbacks, timer expiries and poll
//! results. The submodules are organized by responsibility:
//!
//! - `session`: authorization, connection lifecycle and reconnect policy
//! - `poller`: periodic player state polling
//! - `sequencer`: clip sequencing and stop-boundary auto-advance
//! - `timer`: cancellable generation-keyed timers
//! - `player_events`: event dispatch for the engine loop

mod player_events;
mod poller;
mod sequencer;
mod session;
mod timer;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::auth::{AuthHandshake, TokenStore};
use crate::config::EngineConfig;
use crate::device::{DeviceConnector, DeviceEvent, RemoteDevice};
use crate::error::EngineError;
use crate::model::{ClipRecord, ConnectionState, PlayerCommand, PlayerStateSnapshot, PositionInterpolator};
use crate::notify::NotificationCenter;

pub use sequencer::SequencerStatus;

use poller::StatePoller;
use sequencer::PlaybackSequencer;
use session::SessionManager;

/// Everything that can wake the engine.
pub enum EngineEvent {
    Command(EngineCommand),
    Device {
        epoch: u64,
        event: DeviceEvent,
    },
    AuthCompleted(Result<String, String>),
    ReconnectDue {
        generation: u64,
    },
    SeekDue {
        generation: u64,
        position_ms: u64,
    },
    PollResult {
        generation: u64,
        /// Sequencer play epoch when the request was sent.
        play_epoch: u64,
        result: Result<Option<PlayerStateSnapshot>, String>,
    },
    CommandFailed {
        epoch: u64,
        command: PlayerCommand,
        message: String,
    },
}

/// Requests from outside the engine.
pub enum EngineCommand {
    Authorize(oneshot::Sender<Result<(), EngineError>>),
    AuthCallback {
        payload: String,
        reply: oneshot::Sender<bool>,
    },
    Connect,
    Disconnect,
    ReconnectIfNeeded,
    LoadClips(Vec<ClipRecord>),
    PlayFromIndex(usize),
    PlayNext,
    PlayPrevious,
    TogglePlayPause,
    Stop,
    Shutdown,
}

/// Shared collaborators, constructed once and handed to the engine.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn TokenStore>,
    pub notifications: NotificationCenter,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(store: Arc<dyn TokenStore>, config: EngineConfig) -> Self {
        Self {
            store,
            notifications: NotificationCenter::new(config.notification_lifetime),
            config,
        }
    }
}

pub struct Engine {
    session: SessionManager,
    poller: StatePoller,
    sequencer: PlaybackSequencer,
    interpolator: watch::Sender<PositionInterpolator>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
    pub fn new(
        context: EngineContext,
        handshake: Box<dyn AuthHandshake>,
        connector: Arc<dyn DeviceConnector>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = &context.config;

        let session = SessionManager::new(&context, handshake, connector, tx.clone());
        let poller = StatePoller::new(config.poll_interval, tx.clone());
        let sequencer = PlaybackSequencer::new(config.seek_delay, config.stop_buffer_ms, tx.clone());
        let (interpolator, interpolator_rx) =
            watch::channel(PositionInterpolator::new(config.interpolation_threshold_ms));

        let handle = EngineHandle {
            tx,
            connection: session.subscribe_connection(),
            busy: session.subscribe_busy(),
            last_error: session.subscribe_last_error(),
            device: session.subscribe_device(),
            snapshot: poller.subscribe(),
            status: sequencer.subscribe(),
            interpolator: interpolator_rx,
            notifications: context.notifications.clone(),
        };

        let engine = Self {
            session,
            poller,
            sequencer,
            interpolator,
            rx,
        };
        (engine, handle)
    }

    /// Drive the engine until shutdown.
    pub async fn run(mut self) {
        tracing::info!("Engine started");
        self.session.restore();

        while let Some(event) = self.rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }

        self.poller.stop();
        self.session.shutdown();
        tracing::info!("Engine stopped");
    }

    fn update_clip_start(&self) {
        let start = self
            .sequencer
            .current_clip()
            .map(|clip| clip.start_position_ms)
            .unwrap_or(0);
        self.interpolator.send_modify(|interpolator| interpolator.set_clip_start(start));
    }

    fn apply_snapshot(&mut self, snapshot: PlayerStateSnapshot, play_epoch: u64) {
        self.interpolator
            .send_modify(|interpolator| interpolator.sync(&snapshot, Instant::now()));
        self.sequencer.on_snapshot(&snapshot, play_epoch, &self.session);
        self.update_clip_start();
    }
}

/// Cloneable front door to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    connection: watch::Receiver<ConnectionState>,
    busy: watch::Receiver<bool>,
    last_error: watch::Receiver<Option<String>>,
    device: watch::Receiver<Option<Arc<dyn RemoteDevice>>>,
    snapshot: watch::Receiver<Option<PlayerStateSnapshot>>,
    status: watch::Receiver<SequencerStatus>,
    interpolator: watch::Receiver<PositionInterpolator>,
    notifications: NotificationCenter,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) {
        if self.tx.send(EngineEvent::Command(command)).is_err() {
            tracing::warn!("Engine stopped, command dropped");
        }
    }

    pub async fn authorize(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Authorize(reply));
        rx.await
            .map_err(|_| EngineError::Transient("engine stopped".to_string()))?
    }

    pub async fn handle_auth_callback(&self, payload: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::AuthCallback {
            payload: payload.into(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    pub fn connect(&self) {
        self.send(EngineCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(EngineCommand::Disconnect);
    }

    pub fn reconnect_if_needed(&self) {
        self.send(EngineCommand::ReconnectIfNeeded);
    }

    pub fn load_clips(&self, clips: Vec<ClipRecord>) {
        self.send(EngineCommand::LoadClips(clips));
    }

    pub fn play_from_index(&self, index: usize) {
        self.send(EngineCommand::PlayFromIndex(index));
    }

    pub fn play_next(&self) {
        self.send(EngineCommand::PlayNext);
    }

    pub fn play_previous(&self) {
        self.send(EngineCommand::PlayPrevious);
    }

    pub fn toggle_play_pause(&self) {
        self.send(EngineCommand::TogglePlayPause);
    }

    pub fn stop(&self) {
        self.send(EngineCommand::Stop);
    }

    pub fn shutdown(&self) {
        self.send(EngineCommand::Shutdown);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn current_snapshot(&self) -> Option<PlayerStateSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SequencerStatus {
        self.status.borrow().clone()
    }

    /// Estimated position for display at `now`.
    pub fn display_position(&self, now: Instant) -> u64 {
        self.interpolator.borrow().position_at(now)
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn subscribe_last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.clone()
    }

    pub fn device(&self) -> watch::Receiver<Option<Arc<dyn RemoteDevice>>> {
        self.device.clone()
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }
}
