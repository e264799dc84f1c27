//! Engine timings and process configuration

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8898/login";
const DEFAULT_CLIPS_FILE: &str = "clips.json";
const DEFAULT_TOKEN_FILE: &str = ".cache/token";

/// Timings and limits used by the session engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Delay between `play` and the follow-up `seek` to the clip start.
    pub seek_delay: Duration,
    /// Distance before a clip's stop marker at which it counts as finished.
    pub stop_buffer_ms: u64,
    /// How far past the clip start playback must be before interpolating.
    pub interpolation_threshold_ms: u64,
    pub command_timeout: Duration,
    pub notification_lifetime: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            seek_delay: Duration::from_millis(500),
            stop_buffer_ms: 500,
            interpolation_threshold_ms: 150,
            command_timeout: Duration::from_secs(10),
            notification_lifetime: Duration::from_secs(5),
        }
    }
}

/// Process-level settings read from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub preferred_device: Option<String>,
    pub clips_file: PathBuf,
    pub token_file: PathBuf,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let preferred_device = var("LOOP_DECK_DEVICE").or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string())
        });

        Self {
            client_id: var("SPOTIFY_CLIENT_ID").unwrap_or_default(),
            redirect_uri: var("SPOTIFY_REDIRECT_URI")
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            preferred_device,
            clips_file: var("LOOP_DECK_CLIPS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIPS_FILE)),
            token_file: var("LOOP_DECK_TOKEN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
            engine: EngineConfig::default(),
        }
    }
}
