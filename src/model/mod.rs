//! Model module - Engine data types
//!
//! - `types`: connection state, player commands and state snapshots
//! - `clip`: clip records and the clip file
//! - `playback`: playback cursor and position interpolation
//! - `cache`: artwork cache
//! - `spotify_client`: Spotify Web API device transport

mod types;
mod clip;
mod playback;
mod cache;
pub mod spotify_client;

pub use types::{ConnectionState, PlayerCommand, PlayerStateSnapshot};

pub use clip::{ClipFile, ClipRecord, format_time, sort_clips};

pub use playback::{PlaybackCursor, PositionInterpolator};

pub use cache::{Artwork, ArtworkCache};

pub use spotify_client::{SpotifyConnector, lookup_track, parse_track_link};
