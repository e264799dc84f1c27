//! Remote playback device abstraction
//!
//! A device reports connection changes and pushed player state as
//! [`DeviceEvent`]s instead of calling back into its owner. Each event is
//! tagged with the epoch of the session object that produced it, so events from
//! a torn-down session can be told apart from the live one.

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::controller::EngineEvent;
use crate::model::{PlayerCommand, PlayerStateSnapshot};

/// Callbacks from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected,
    ConnectionFailed(String),
    Disconnected(Option<String>),
    StateChanged(PlayerStateSnapshot),
}

/// Where a device delivers its events.
#[derive(Clone)]
pub struct DeviceEventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl DeviceEventSender {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn emit(&self, event: DeviceEvent) {
        if self
            .tx
            .send(EngineEvent::Device {
                epoch: self.epoch,
                event,
            })
            .is_err()
        {
            tracing::trace!(epoch = self.epoch, "Engine gone, dropping device event");
        }
    }
}

/// A live control session with one remote playback device.
///
/// `connect` and `disconnect` return immediately; their outcome arrives as a
/// [`DeviceEvent`]. The returned futures are `'static` so they can be spawned.
pub trait RemoteDevice: Send + Sync {
    fn connect(&self);

    /// Tear down without emitting `Disconnected`.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn execute(&self, command: PlayerCommand) -> BoxFuture<'static, Result<()>>;

    fn player_state(&self) -> BoxFuture<'static, Result<Option<PlayerStateSnapshot>>>;

    /// Ask for pushed `StateChanged` events. Returns `false` when the
    /// transport has no push channel.
    fn subscribe_state(&self) -> bool;

    /// Look up the artwork URL for a track through the device's own API.
    fn artwork_url(&self, track_uri: &str) -> BoxFuture<'static, Result<Option<String>>>;
}

/// Builds session objects from a credential.
pub trait DeviceConnector: Send + Sync {
    fn open(&self, credential: &str, events: DeviceEventSender) -> Arc<dyn RemoteDevice>;
}
