//! Core type definitions shared by the engine components

use std::fmt;

/// Live control session state. Only the session manager mutates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// A command sent to the remote playback device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayerCommand {
    Play(String),
    Pause,
    Resume,
    Seek(u64),
}

impl PlayerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerCommand::Play(_) => "play",
            PlayerCommand::Pause => "pause",
            PlayerCommand::Resume => "resume",
            PlayerCommand::Seek(_) => "seek",
        }
    }
}

/// Immutable point-in-time view of the remote player.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PlayerStateSnapshot {
    pub track_uri: Option<String>,
    pub track_name: String,
    pub artist_name: String,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub is_paused: bool,
}

impl PlayerStateSnapshot {
    /// Whether the snapshot describes a different track than `uri`.
    ///
    /// A snapshot without a track identifier never counts as different.
    pub fn is_other_track(&self, uri: &str) -> bool {
        self.track_uri.as_deref().is_some_and(|current| current != uri)
    }
}
