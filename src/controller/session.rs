//! Session manager: authorization, connection lifecycle and reconnects

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::sequencer::CommandSink;
use super::timer::TimerSlot;
use super::{EngineContext, EngineEvent};
use crate::auth::{AuthHandshake, TokenStore};
use crate::config::EngineConfig;
use crate::device::{DeviceConnector, DeviceEvent, DeviceEventSender, RemoteDevice};
use crate::error::{EngineError, ErrorClass, SESSION_EXPIRED_MESSAGE};
use crate::model::{ConnectionState, PlayerCommand, PlayerStateSnapshot};
use crate::notify::NotificationCenter;

const UNAVAILABLE_MESSAGE: &str =
    "Spotify authorization is unavailable. Set SPOTIFY_CLIENT_ID and try again.";

/// What the engine must do after a session callback.
pub enum SessionOutcome {
    Unchanged,
    Connected(Arc<dyn RemoteDevice>),
    Disconnected,
    State(PlayerStateSnapshot),
}

/// Result of applying the bounded retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    Scheduled { attempt: u32 },
    GaveUp,
    NoCredential,
}

pub struct SessionManager {
    store: Arc<dyn TokenStore>,
    handshake: Box<dyn AuthHandshake>,
    connector: Arc<dyn DeviceConnector>,
    notifications: NotificationCenter,
    config: EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,

    credential: Option<String>,
    device: Option<Arc<dyn RemoteDevice>>,
    device_epoch: u64,
    commands: Option<mpsc::UnboundedSender<PlayerCommand>>,
    command_worker: Option<JoinHandle<()>>,
    handshake_in_flight: bool,
    reconnect_attempts: u32,
    reconnect_timer: TimerSlot,

    connection: watch::Sender<ConnectionState>,
    busy: watch::Sender<bool>,
    last_error: watch::Sender<Option<String>>,
    published_device: watch::Sender<Option<Arc<dyn RemoteDevice>>>,
}

impl SessionManager {
    pub fn new(
        context: &EngineContext,
        handshake: Box<dyn AuthHandshake>,
        connector: Arc<dyn DeviceConnector>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let credential = context.store.load();
        if credential.is_some() {
            tracing::info!("Found stored credential");
        }

        Self {
            store: context.store.clone(),
            handshake,
            connector,
            notifications: context.notifications.clone(),
            config: context.config.clone(),
            events,
            credential,
            device: None,
            device_epoch: 0,
            commands: None,
            command_worker: None,
            handshake_in_flight: false,
            reconnect_attempts: 0,
            reconnect_timer: TimerSlot::new(),
            connection: watch::channel(ConnectionState::Disconnected).0,
            busy: watch::channel(false).0,
            last_error: watch::channel(None).0,
            published_device: watch::channel(None).0,
        }
    }

    // ========================================================================
    // Published signals
    // ========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    pub fn subscribe_last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    pub fn subscribe_device(&self) -> watch::Receiver<Option<Arc<dyn RemoteDevice>>> {
        self.published_device.subscribe()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer.is_pending()
    }

    pub fn device_epoch(&self) -> u64 {
        self.device_epoch
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.connection.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn set_busy(&self, busy: bool) {
        self.busy.send_replace(busy);
    }

    fn clear_error(&self) {
        self.last_error.send_replace(None);
    }

    /// Publish an error message and raise exactly one notification for it.
    fn surface(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "Surfacing error");
        self.last_error.send_replace(Some(message.clone()));
        self.notifications.notify(message);
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Resume a stored session at startup.
    pub fn restore(&mut self) {
        if self.credential.is_some() {
            tracing::info!("Restoring session from stored credential");
            self.set_busy(true);
            self.connect();
        }
    }

    pub fn authorize(&mut self) -> Result<(), EngineError> {
        self.clear_error();
        self.reconnect_attempts = 0;

        if !self.handshake.is_available() {
            tracing::error!("Authorization provider unavailable");
            self.surface(UNAVAILABLE_MESSAGE);
            return Err(EngineError::DeviceUnavailable(UNAVAILABLE_MESSAGE.to_string()));
        }

        self.set_busy(true);
        match self.handshake.begin() {
            Ok(()) => {
                self.handshake_in_flight = true;
                Ok(())
            }
            Err(e) => {
                self.set_busy(false);
                let message = format!("Could not start authorization: {}", e);
                self.surface(message.clone());
                Err(EngineError::Transient(message))
            }
        }
    }

    pub fn handle_auth_callback(&mut self, payload: &str) -> bool {
        if !self.handshake_in_flight {
            tracing::debug!("Auth callback with no handshake in flight");
            return false;
        }
        let Some(exchange) = self.handshake.complete(payload) else {
            tracing::debug!("Auth callback not consumed by handshake");
            return false;
        };

        self.handshake_in_flight = false;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = exchange.await.map_err(|e| e.to_string());
            let _ = events.send(EngineEvent::AuthCompleted(result));
        });
        true
    }

    pub fn on_auth_completed(&mut self, result: Result<String, String>) -> SessionOutcome {
        match result {
            Ok(credential) => {
                tracing::info!("Authorization succeeded");
                if let Err(e) = self.store.save(&credential) {
                    tracing::error!(error = %e, "Failed to persist credential");
                }
                self.credential = Some(credential);
                // A fresh credential always gets a fresh session object.
                let was_connected = self.connection_state().is_connected();
                self.teardown_device();
                self.set_state(ConnectionState::Disconnected);
                self.connect();
                if was_connected {
                    SessionOutcome::Disconnected
                } else {
                    SessionOutcome::Unchanged
                }
            }
            Err(message) => {
                tracing::error!(error = %message, "Authorization failed");
                self.set_busy(false);
                self.handle_connection_error(&message);
                SessionOutcome::Unchanged
            }
        }
    }

    pub fn connect(&mut self) {
        let Some(credential) = self.credential.clone() else {
            tracing::debug!("Connect requested without a credential");
            return;
        };
        if self.connection_state().is_connected() {
            tracing::debug!("Connect requested while already connected");
            return;
        }

        if self.device.is_none() {
            self.open_device(&credential);
        }

        self.clear_error();
        self.set_state(ConnectionState::Connecting);
        if let Some(device) = &self.device {
            tracing::debug!(epoch = self.device_epoch, "Connecting to device");
            device.connect();
        }
    }

    /// Drop the live connection but keep the credential.
    pub fn disconnect(&mut self) -> SessionOutcome {
        self.reconnect_timer.cancel();
        self.set_busy(false);
        if let Some(device) = &self.device {
            device.disconnect();
        }
        let was_connected = self.connection_state() != ConnectionState::Disconnected;
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            SessionOutcome::Disconnected
        } else {
            SessionOutcome::Unchanged
        }
    }

    pub fn reconnect_if_needed(&mut self) {
        match self.connection_state() {
            ConnectionState::Connected => return,
            ConnectionState::Connecting => {
                tracing::debug!("Connection attempt already in progress");
                return;
            }
            ConnectionState::Disconnected => {}
        }
        if self.credential.is_none() {
            return;
        }
        self.set_busy(true);
        self.connect();
    }

    pub fn on_reconnect_due(&mut self, generation: u64) {
        if self.reconnect_timer.fire(generation) {
            tracing::info!(attempt = self.reconnect_attempts, "Reconnect timer fired");
            self.reconnect_if_needed();
        }
    }

    // ========================================================================
    // Device callbacks
    // ========================================================================

    pub fn on_device_event(&mut self, epoch: u64, event: DeviceEvent) -> SessionOutcome {
        if epoch != self.device_epoch || self.device.is_none() {
            tracing::trace!(epoch, current = self.device_epoch, "Ignoring event from stale session");
            return SessionOutcome::Unchanged;
        }

        match event {
            DeviceEvent::Connected => self.on_connected(),
            DeviceEvent::ConnectionFailed(message) => {
                self.on_connection_failed(&message);
                SessionOutcome::Disconnected
            }
            DeviceEvent::Disconnected(message) => {
                self.on_disconnected(message.as_deref());
                SessionOutcome::Disconnected
            }
            DeviceEvent::StateChanged(snapshot) => SessionOutcome::State(snapshot),
        }
    }

    fn on_connected(&mut self) -> SessionOutcome {
        tracing::info!(epoch = self.device_epoch, "Connected to Spotify");
        self.set_state(ConnectionState::Connected);
        self.reconnect_attempts = 0;
        self.reconnect_timer.cancel();
        self.set_busy(false);
        self.clear_error();
        match &self.device {
            Some(device) => SessionOutcome::Connected(device.clone()),
            None => SessionOutcome::Unchanged,
        }
    }

    pub fn on_connection_failed(&mut self, message: &str) -> ReconnectDecision {
        tracing::warn!(error = %message, "Connection attempt failed");
        self.set_state(ConnectionState::Disconnected);
        if !self.handle_connection_error(message).is_retryable() {
            return ReconnectDecision::NoCredential;
        }
        self.schedule_reconnect()
    }

    pub fn on_disconnected(&mut self, message: Option<&str>) -> ReconnectDecision {
        tracing::warn!(error = ?message, "Disconnected from Spotify");
        self.set_state(ConnectionState::Disconnected);
        if let Some(message) = message {
            if !self.handle_connection_error(message).is_retryable() {
                return ReconnectDecision::NoCredential;
            }
        }
        self.schedule_reconnect()
    }

    pub fn on_command_failed(&mut self, epoch: u64, command: &PlayerCommand, message: &str) -> SessionOutcome {
        if epoch != self.device_epoch {
            return SessionOutcome::Unchanged;
        }
        if ErrorClass::classify(message) == ErrorClass::ExpiredCredential {
            let was_connected = self.connection_state().is_connected();
            self.expire_credential(message);
            return if was_connected {
                SessionOutcome::Disconnected
            } else {
                SessionOutcome::Unchanged
            };
        }
        match command {
            // Pausing a device that already stopped fails routinely.
            PlayerCommand::Pause => {
                tracing::warn!(error = %message, "Pause failed");
            }
            _ => self.surface(EngineError::command(command, message).to_string()),
        }
        SessionOutcome::Unchanged
    }

    // ========================================================================
    // Classification and retry
    // ========================================================================

    fn handle_connection_error(&mut self, message: &str) -> EngineError {
        let error = EngineError::from_message(message);
        match &error {
            EngineError::ExpiredCredential(raw) => self.expire_credential(raw),
            _ => self.surface(error.to_string()),
        }
        error
    }

    fn expire_credential(&mut self, message: &str) {
        tracing::warn!(error = %message, "Credential expired, clearing session");
        self.credential = None;
        if let Err(e) = self.store.delete() {
            tracing::error!(error = %e, "Failed to delete stored credential");
        }
        self.reconnect_timer.cancel();
        self.reconnect_attempts = 0;
        self.set_busy(false);
        self.teardown_device();
        self.set_state(ConnectionState::Disconnected);
        self.surface(SESSION_EXPIRED_MESSAGE);
    }

    fn schedule_reconnect(&mut self) -> ReconnectDecision {
        self.reconnect_timer.cancel();

        if self.credential.is_none() {
            self.set_busy(false);
            return ReconnectDecision::NoCredential;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            tracing::error!(attempts = self.reconnect_attempts, "Giving up on reconnecting");
            self.set_busy(false);
            self.surface(format!(
                "Could not reconnect to Spotify after {} attempts. Connect again to retry.",
                self.config.max_reconnect_attempts
            ));
            return ReconnectDecision::GaveUp;
        }

        self.set_busy(true);
        self.reconnect_timer.schedule(self.config.reconnect_delay, &self.events, |generation| {
            EngineEvent::ReconnectDue { generation }
        });
        tracing::info!(
            attempt = self.reconnect_attempts,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        ReconnectDecision::Scheduled {
            attempt: self.reconnect_attempts,
        }
    }

    // ========================================================================
    // Session object
    // ========================================================================

    fn open_device(&mut self, credential: &str) {
        self.device_epoch += 1;
        let epoch = self.device_epoch;
        let device = self
            .connector
            .open(credential, DeviceEventSender::new(epoch, self.events.clone()));

        let (tx, rx) = mpsc::unbounded_channel();
        self.command_worker = Some(spawn_command_worker(
            device.clone(),
            rx,
            epoch,
            self.config.command_timeout,
            self.events.clone(),
        ));
        self.commands = Some(tx);
        self.published_device.send_replace(Some(device.clone()));
        self.device = Some(device);
    }

    fn teardown_device(&mut self) {
        if let Some(device) = self.device.take() {
            device.disconnect();
        }
        if let Some(worker) = self.command_worker.take() {
            worker.abort();
        }
        self.commands = None;
        self.device_epoch += 1;
        self.published_device.send_replace(None);
    }

    pub fn shutdown(&mut self) {
        self.reconnect_timer.cancel();
        self.teardown_device();
        self.set_state(ConnectionState::Disconnected);
    }
}

impl CommandSink for SessionManager {
    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    fn issue(&self, command: PlayerCommand) {
        if !self.is_connected() {
            tracing::debug!(command = command.name(), "Not connected, dropping command");
            return;
        }
        match &self.commands {
            Some(commands) => {
                if commands.send(command).is_err() {
                    tracing::warn!("Command worker stopped");
                }
            }
            None => tracing::debug!("No session object, dropping command"),
        }
    }
}

/// Executes commands one at a time so a pause issued before a play never
/// overtakes it on the wire.
fn spawn_command_worker(
    device: Arc<dyn RemoteDevice>,
    mut commands: mpsc::UnboundedReceiver<PlayerCommand>,
    epoch: u64,
    timeout: std::time::Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match tokio::time::timeout(timeout, device.execute(command.clone())).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {}ms", timeout.as_millis())),
            };
            crate::log_command_result!(command.name(), result);
            if let Err(e) = result {
                let _ = events.send(EngineEvent::CommandFailed {
                    epoch,
                    command,
                    message: e.to_string(),
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{FakeConnector, FakeHandshake, MemoryTokenStore, test_context};

    fn session_with(
        token: Option<&str>,
        available: bool,
    ) -> (
        SessionManager,
        mpsc::UnboundedReceiver<EngineEvent>,
        Arc<MemoryTokenStore>,
        FakeConnector,
    ) {
        let store = Arc::new(MemoryTokenStore::new(token));
        let context = test_context(store.clone());
        let connector = FakeConnector::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(
            &context,
            Box::new(FakeHandshake::new(available, "fresh-token")),
            Arc::new(connector.clone()),
            tx,
        );
        (session, rx, store, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_schedule_at_most_three_reconnects() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();

        let decisions: Vec<ReconnectDecision> = (0..5)
            .map(|_| session.on_connection_failed("connection reset by peer"))
            .collect();

        let scheduled = decisions
            .iter()
            .filter(|d| matches!(d, ReconnectDecision::Scheduled { .. }))
            .count();
        assert_eq!(scheduled, 3);
        assert_eq!(decisions[3], ReconnectDecision::GaveUp);
        assert!(!session.reconnect_pending());
        assert!(!session.is_busy());
        assert!(
            session
                .last_error()
                .is_some_and(|e| e.contains("Could not reconnect"))
        );
        assert!(session.has_credential());
    }

    #[tokio::test(start_paused = true)]
    async fn fewer_failures_schedule_one_each() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();

        assert_eq!(
            session.on_connection_failed("timeout"),
            ReconnectDecision::Scheduled { attempt: 1 }
        );
        assert_eq!(
            session.on_connection_failed("timeout"),
            ReconnectDecision::Scheduled { attempt: 2 }
        );
        assert!(session.reconnect_pending());
        assert!(session.is_busy());
        assert_eq!(session.last_error().as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_credential_clears_and_never_retries() {
        let (mut session, _rx, store, _connector) = session_with(Some("token"), true);
        session.restore();

        let decision = session.on_connection_failed("OAuth: invalid_grant");

        assert_eq!(decision, ReconnectDecision::NoCredential);
        assert!(!session.has_credential());
        assert_eq!(store.load(), None);
        assert_eq!(store.deletes(), 1);
        assert!(!session.reconnect_pending());
        assert_eq!(session.last_error().as_deref(), Some(SESSION_EXPIRED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_cancels_pending_reconnect() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        session.on_connection_failed("network unreachable");
        assert!(session.reconnect_pending());

        session.on_disconnected(Some("Token has EXPIRED"));
        assert!(!session.reconnect_pending());
        assert!(!session.has_credential());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connection_resets_attempts() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        session.on_connection_failed("timeout");
        session.on_connection_failed("timeout");

        let epoch = session.device_epoch();
        let outcome = session.on_device_event(epoch, DeviceEvent::Connected);

        assert!(matches!(outcome, SessionOutcome::Connected(_)));
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(!session.reconnect_pending());
        assert_eq!(session.last_error(), None);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn authorize_fails_fast_when_unavailable() {
        let (mut session, _rx, _store, _connector) = session_with(None, false);

        let result = session.authorize();

        assert!(matches!(result, Err(EngineError::DeviceUnavailable(_))));
        assert!(!session.is_busy());
        assert!(!session.handle_auth_callback("loop://callback?code=abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn authorize_resets_attempt_counter() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        session.on_connection_failed("timeout");
        assert_eq!(session.reconnect_attempts(), 1);

        session.authorize().unwrap();
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_callback_without_handshake_is_ignored() {
        let (mut session, mut rx, _store, _connector) = session_with(None, true);
        assert!(!session.handle_auth_callback("loop://callback?code=abc"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_callback_completes_into_connect() {
        let (mut session, mut rx, store, connector) = session_with(None, true);
        session.authorize().unwrap();

        assert!(!session.handle_auth_callback("unrelated://payload"));
        assert!(session.handle_auth_callback("loop://callback?code=abc"));

        let result = match rx.recv().await {
            Some(EngineEvent::AuthCompleted(result)) => result,
            _ => panic!("expected auth completion"),
        };
        session.on_auth_completed(result);

        assert_eq!(store.load().as_deref(), Some("fresh-token"));
        assert!(session.has_credential());
        assert_eq!(connector.opened(), 1);
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_events_are_ignored() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        let stale = session.device_epoch() - 1;

        let outcome = session.on_device_event(stale, DeviceEvent::Connected);
        assert!(matches!(outcome, SessionOutcome::Unchanged));
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_if_needed_is_noop_when_connected() {
        let (mut session, _rx, _store, connector) = session_with(Some("token"), true);
        session.restore();
        let epoch = session.device_epoch();
        session.on_device_event(epoch, DeviceEvent::Connected);
        let connects = connector.connects();

        session.reconnect_if_needed();
        assert_eq!(connector.connects(), connects);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_credential() {
        let (mut session, _rx, store, _connector) = session_with(Some("token"), true);
        session.restore();
        let epoch = session.device_epoch();
        session.on_device_event(epoch, DeviceEvent::Connected);

        assert!(matches!(session.disconnect(), SessionOutcome::Disconnected));
        assert!(session.has_credential());
        assert_eq!(store.load().as_deref(), Some("token"));
        assert!(!session.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn command_failure_with_token_error_expires_session() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        let epoch = session.device_epoch();
        session.on_device_event(epoch, DeviceEvent::Connected);

        let outcome = session.on_command_failed(epoch, &PlayerCommand::Play("spotify:track:a".into()), "access token expired (401)");
        assert!(matches!(outcome, SessionOutcome::Disconnected));
        assert!(!session.has_credential());
    }

    #[tokio::test(start_paused = true)]
    async fn command_failure_surfaces_without_state_change() {
        let (mut session, _rx, _store, _connector) = session_with(Some("token"), true);
        session.restore();
        let epoch = session.device_epoch();
        session.on_device_event(epoch, DeviceEvent::Connected);

        session.on_command_failed(epoch, &PlayerCommand::Seek(5000), "device busy");
        assert_eq!(session.last_error().as_deref(), Some("seek failed: device busy"));
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(!session.reconnect_pending());
    }
}
