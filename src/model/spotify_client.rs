//! Spotify Web API transport for the remote playback device

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use rspotify::{
    AuthCodeSpotify, Token,
    model::{CurrentPlaybackContext, PlayableId, PlayableItem, TrackId},
    prelude::*,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::types::{PlayerCommand, PlayerStateSnapshot};
use crate::auth::SCOPES;
use crate::device::{DeviceConnector, DeviceEvent, DeviceEventSender, RemoteDevice};

const NO_DEVICE_MESSAGE: &str = "No Spotify device available. Open Spotify on a device and try again.";

/// Control session with whichever Spotify Connect device is playing.
#[derive(Clone)]
pub struct SpotifyClient {
    client: Arc<AuthCodeSpotify>,
    preferred_device: Option<String>,
    device_id: Arc<RwLock<Option<String>>>,
    connected: Arc<AtomicBool>,
    connect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    events: DeviceEventSender,
}

impl SpotifyClient {
    pub fn new(credential: &str, preferred_device: Option<String>, events: DeviceEventSender) -> Self {
        Self {
            client: Arc::new(client_for(credential)),
            preferred_device,
            device_id: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            connect_task: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Pick the device to control: the active one, else the preferred one.
    async fn resolve_device(&self) -> Result<Option<String>> {
        let devices = self.client.device().await.map_err(|e| anyhow!(describe_error(&e)))?;

        if let Some(device) = devices.iter().find(|d| d.is_active) {
            tracing::debug!(device_name = %device.name, device_id = ?device.id, "Found active device");
            return Ok(device.id.clone());
        }

        if let Some(preferred) = &self.preferred_device {
            if let Some(device) = devices.iter().find(|d| &d.name == preferred) {
                tracing::debug!(device_name = %device.name, device_id = ?device.id, "No active device, using preferred device");
                return Ok(device.id.clone());
            }
        }

        tracing::debug!(available_devices = devices.len(), "No active or preferred device found");
        Ok(None)
    }

    /// Report a lost session once, when the API rejects the credential.
    fn drop_connection(&self, message: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %message, "Spotify session rejected");
            self.events.emit(DeviceEvent::Disconnected(Some(message.to_string())));
        }
    }

    async fn run(&self, command: PlayerCommand) -> Result<()> {
        let device_id = self.device_id.read().await.clone();
        tracing::debug!(command = command.name(), device_id = ?device_id, "API: player command");

        let result = match command {
            PlayerCommand::Play(uri) => {
                let track_id = track_id_from_uri(&uri);
                let playable = PlayableId::Track(TrackId::from_id(track_id)?);
                self.client
                    .start_uris_playback([playable], device_id.as_deref(), None, None)
                    .await
            }
            PlayerCommand::Pause => self.client.pause_playback(device_id.as_deref()).await,
            PlayerCommand::Resume => self.client.resume_playback(device_id.as_deref(), None).await,
            PlayerCommand::Seek(position_ms) => {
                self.client
                    .seek_track(
                        chrono::Duration::milliseconds(position_ms as i64),
                        device_id.as_deref(),
                    )
                    .await
            }
        };

        result.map_err(|e| anyhow!(describe_error(&e)))
    }

    async fn fetch_state(&self) -> Result<Option<PlayerStateSnapshot>> {
        tracing::trace!("Fetching current playback state");
        match self.client.current_playback(None, None::<Vec<_>>).await {
            Ok(playback) => Ok(playback.as_ref().and_then(snapshot_from_playback)),
            Err(e) => {
                let message = describe_error(&e);
                if is_unauthorized(&message) {
                    self.drop_connection(&message);
                }
                Err(anyhow!(message))
            }
        }
    }

    async fn fetch_artwork_url(&self, track_uri: String) -> Result<Option<String>> {
        let track_id = TrackId::from_id(track_id_from_uri(&track_uri))?;
        let track = self
            .client
            .track(track_id, None)
            .await
            .map_err(|e| anyhow!(describe_error(&e)))?;
        Ok(track.album.images.first().map(|image| image.url.clone()))
    }
}

impl RemoteDevice for SpotifyClient {
    fn connect(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            match this.resolve_device().await {
                Ok(Some(device_id)) => {
                    *this.device_id.write().await = Some(device_id);
                    this.connected.store(true, Ordering::SeqCst);
                    this.events.emit(DeviceEvent::Connected);
                }
                Ok(None) => {
                    this.events.emit(DeviceEvent::ConnectionFailed(NO_DEVICE_MESSAGE.to_string()));
                }
                Err(e) => {
                    this.events.emit(DeviceEvent::ConnectionFailed(e.to_string()));
                }
            }
        });

        if let Ok(mut slot) = self.connect_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn disconnect(&self) {
        if let Ok(mut slot) = self.connect_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn execute(&self, command: PlayerCommand) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move { this.run(command).await }.boxed()
    }

    fn player_state(&self) -> BoxFuture<'static, Result<Option<PlayerStateSnapshot>>> {
        let this = self.clone();
        async move { this.fetch_state().await }.boxed()
    }

    fn subscribe_state(&self) -> bool {
        // The Web API has no push channel; polling covers it.
        false
    }

    fn artwork_url(&self, track_uri: &str) -> BoxFuture<'static, Result<Option<String>>> {
        let this = self.clone();
        let track_uri = track_uri.to_string();
        async move { this.fetch_artwork_url(track_uri).await }.boxed()
    }
}

/// Opens [`SpotifyClient`] sessions.
pub struct SpotifyConnector {
    preferred_device: Option<String>,
}

impl SpotifyConnector {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

impl DeviceConnector for SpotifyConnector {
    fn open(&self, credential: &str, events: DeviceEventSender) -> Arc<dyn RemoteDevice> {
        tracing::debug!(epoch = events.epoch(), "Opening Spotify Web API session");
        Arc::new(SpotifyClient::new(credential, self.preferred_device.clone(), events))
    }
}

/// Catalog details for a single track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    pub track_uri: String,
    pub track_name: String,
    pub artist_name: String,
    pub duration_ms: u64,
}

/// Look up a track in the catalog with the given credential.
pub async fn lookup_track(credential: &str, track_uri: &str) -> Result<TrackInfo> {
    let client = client_for(credential);
    let track_id = TrackId::from_id(track_id_from_uri(track_uri))?;
    tracing::debug!(track_uri, "API: track lookup");
    let track = client
        .track(track_id, None)
        .await
        .map_err(|e| anyhow!(describe_error(&e)))?;

    Ok(TrackInfo {
        track_uri: track_uri.to_string(),
        track_name: track.name,
        artist_name: track
            .artists
            .first()
            .map(|a| a.name.clone())
            .unwrap_or_default(),
        duration_ms: track.duration.num_milliseconds().max(0) as u64,
    })
}

/// Accepts `spotify:track:ID` or an `open.spotify.com` track link, with or
/// without a locale segment and query string. Returns the track URI.
pub fn parse_track_link(input: &str) -> Option<String> {
    let input = input.trim();
    if let Some(id) = input.strip_prefix("spotify:track:") {
        return (!id.is_empty()).then(|| input.to_string());
    }

    let rest = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
        .unwrap_or(input);
    let (host, path) = rest.split_once('/')?;
    if !host.ends_with("open.spotify.com") {
        return None;
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments.find(|s| *s == "track")?;
    let id = segments.next()?;
    Some(format!("spotify:track:{}", id))
}

/// Web API client over a bare access token.
fn client_for(credential: &str) -> AuthCodeSpotify {
    let token = Token {
        access_token: credential.to_string(),
        expires_in: chrono::Duration::seconds(3600),
        expires_at: Some(Utc::now() + chrono::Duration::seconds(3600)),
        scopes: SCOPES
            .split_whitespace()
            .map(|s| s.to_string())
            .collect::<HashSet<String>>(),
        refresh_token: None,
    };
    AuthCodeSpotify::from_token(token)
}

/// `spotify:track:ID` to `ID`. Bare ids pass through.
pub fn track_id_from_uri(uri: &str) -> &str {
    uri.rsplit(':').next().unwrap_or(uri)
}

/// Error text with 401 responses spelled out as an expired token, so the
/// session manager classifies them correctly.
fn describe_error(error: &impl std::fmt::Display) -> String {
    let message = error.to_string();
    if is_unauthorized(&message) {
        format!("access token expired ({})", message)
    } else {
        message
    }
}

/// rspotify renders HTTP failures as `status code <code> <reason>`.
fn is_unauthorized(message: &str) -> bool {
    message.contains("status code 401")
}

fn snapshot_from_playback(playback: &CurrentPlaybackContext) -> Option<PlayerStateSnapshot> {
    let position_ms = playback
        .progress
        .map(|d| d.num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    let is_paused = !playback.is_playing;

    match playback.item.as_ref()? {
        PlayableItem::Track(track) => {
            let artist_name = track
                .artists
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_default();
            let track_uri = track
                .id
                .as_ref()
                .map(|id| format!("spotify:track:{}", id.id()));

            Some(PlayerStateSnapshot {
                track_uri,
                track_name: track.name.clone(),
                artist_name,
                position_ms,
                duration_ms: track.duration.num_milliseconds().max(0) as u64,
                is_paused,
            })
        }
        PlayableItem::Episode(episode) => Some(PlayerStateSnapshot {
            track_uri: Some(format!("spotify:episode:{}", episode.id.id())),
            track_name: episode.name.clone(),
            artist_name: episode.show.name.clone(),
            position_ms,
            duration_ms: episode.duration.num_milliseconds().max(0) as u64,
            is_paused,
        }),
        PlayableItem::Unknown(_) => None,
    }
}
