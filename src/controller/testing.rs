//! In-memory fakes for engine tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::future::{BoxFuture, FutureExt};

use super::EngineContext;
use super::sequencer::CommandSink;
use crate::auth::{AuthHandshake, TokenStore};
use crate::config::EngineConfig;
use crate::device::{DeviceConnector, DeviceEvent, DeviceEventSender, RemoteDevice};
use crate::model::{PlayerCommand, PlayerStateSnapshot};

const CALLBACK_PREFIX: &str = "loop://callback?code=";

pub fn test_context(store: Arc<MemoryTokenStore>) -> EngineContext {
    EngineContext::new(
        store,
        EngineConfig {
            notification_lifetime: Duration::from_secs(60),
            ..EngineConfig::default()
        },
    )
}

// ============================================================================
// Credentials
// ============================================================================

pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
    deletes: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: Mutex::new(token.map(str::to_string)),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap() = Some(token.to_string());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}

pub struct FakeHandshake {
    available: bool,
    token: String,
    begun: bool,
}

impl FakeHandshake {
    pub fn new(available: bool, token: &str) -> Self {
        Self {
            available,
            token: token.to_string(),
            begun: false,
        }
    }
}

impl AuthHandshake for FakeHandshake {
    fn is_available(&self) -> bool {
        self.available
    }

    fn begin(&mut self) -> Result<()> {
        self.begun = true;
        Ok(())
    }

    fn complete(&mut self, payload: &str) -> Option<BoxFuture<'static, Result<String>>> {
        if !self.begun || !payload.starts_with(CALLBACK_PREFIX) {
            return None;
        }
        self.begun = false;
        let token = self.token.clone();
        Some(async move { Ok(token) }.boxed())
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Clone, Debug)]
pub enum ConnectBehavior {
    /// Never report back.
    Silent,
    Succeed,
    Fail(String),
}

struct DeviceInner {
    events: Option<DeviceEventSender>,
    behavior: ConnectBehavior,
    push: bool,
    connects: Arc<AtomicUsize>,
    connected: AtomicBool,
    commands: Mutex<Vec<PlayerCommand>>,
    command_error: Mutex<Option<String>>,
    state: Mutex<Option<PlayerStateSnapshot>>,
}

#[derive(Clone)]
pub struct FakeDevice {
    inner: Arc<DeviceInner>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::build(None, ConnectBehavior::Silent, false, Arc::new(AtomicUsize::new(0)))
    }

    fn build(
        events: Option<DeviceEventSender>,
        behavior: ConnectBehavior,
        push: bool,
        connects: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                events,
                behavior,
                push,
                connects,
                connected: AtomicBool::new(false),
                commands: Mutex::new(Vec::new()),
                command_error: Mutex::new(None),
                state: Mutex::new(None),
            }),
        }
    }

    pub fn set_state(&self, state: Option<PlayerStateSnapshot>) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Store `snapshot` and push it as a state change.
    pub fn push_state(&self, snapshot: PlayerStateSnapshot) {
        self.set_state(Some(snapshot.clone()));
        self.emit(DeviceEvent::StateChanged(snapshot));
    }

    pub fn fail_commands(&self, message: &str) {
        *self.inner.command_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn commands(&self) -> Vec<PlayerCommand> {
        self.inner.commands.lock().unwrap().clone()
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(events) = &self.inner.events {
            events.emit(event);
        }
    }
}

impl RemoteDevice for FakeDevice {
    fn connect(&self) {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        match &self.inner.behavior {
            ConnectBehavior::Silent => {}
            ConnectBehavior::Succeed => {
                self.inner.connected.store(true, Ordering::SeqCst);
                self.emit(DeviceEvent::Connected);
            }
            ConnectBehavior::Fail(message) => {
                self.emit(DeviceEvent::ConnectionFailed(message.clone()));
            }
        }
    }

    fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn execute(&self, command: PlayerCommand) -> BoxFuture<'static, Result<()>> {
        self.inner.commands.lock().unwrap().push(command);
        let error = self.inner.command_error.lock().unwrap().clone();
        async move {
            match error {
                Some(message) => Err(anyhow!(message)),
                None => Ok(()),
            }
        }
        .boxed()
    }

    fn player_state(&self) -> BoxFuture<'static, Result<Option<PlayerStateSnapshot>>> {
        let state = self.inner.state.lock().unwrap().clone();
        async move { Ok(state) }.boxed()
    }

    fn subscribe_state(&self) -> bool {
        self.inner.push
    }

    fn artwork_url(&self, _track_uri: &str) -> BoxFuture<'static, Result<Option<String>>> {
        async { Ok(None) }.boxed()
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    behavior: ConnectBehavior,
    push: bool,
    connects: Arc<AtomicUsize>,
    devices: Arc<Mutex<Vec<FakeDevice>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::with_behavior(ConnectBehavior::Silent)
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            push: false,
            connects: Arc::new(AtomicUsize::new(0)),
            devices: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Devices opened from here accept state subscriptions.
    pub fn with_push(mut self) -> Self {
        self.push = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_device(&self) -> Option<FakeDevice> {
        self.devices.lock().unwrap().last().cloned()
    }
}

impl DeviceConnector for FakeConnector {
    fn open(&self, _credential: &str, events: DeviceEventSender) -> Arc<dyn RemoteDevice> {
        let device = FakeDevice::build(
            Some(events),
            self.behavior.clone(),
            self.push,
            self.connects.clone(),
        );
        self.devices.lock().unwrap().push(device.clone());
        Arc::new(device)
    }
}

// ============================================================================
// Command sink
// ============================================================================

pub struct RecordingSink {
    connected: bool,
    commands: Mutex<Vec<PlayerCommand>>,
}

impl RecordingSink {
    pub fn connected() -> Self {
        Self {
            connected: true,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<PlayerCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }
}

impl CommandSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn issue(&self, command: PlayerCommand) {
        if self.connected {
            self.commands.lock().unwrap().push(command);
        }
    }
}
