//! Clip records and the file-backed clip store

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::spotify_client::TrackInfo;

/// A trimmed start/stop window over a single track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub id: Uuid,
    pub track_uri: String,
    pub track_name: String,
    pub artist_name: String,
    #[serde(default)]
    pub start_position_ms: u64,
    pub stop_position_ms: u64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub order: i64,
}

impl ClipRecord {
    pub fn new(track_uri: impl Into<String>, start_position_ms: u64, stop_position_ms: u64, order: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_uri: track_uri.into(),
            track_name: String::new(),
            artist_name: String::new(),
            start_position_ms,
            stop_position_ms,
            duration_ms: None,
            order,
        }
    }

    /// Clip spanning the whole track, appended at `order`.
    pub fn from_track(track: TrackInfo, order: i64) -> Self {
        Self {
            track_name: track.track_name,
            artist_name: track.artist_name,
            duration_ms: Some(track.duration_ms),
            ..Self::new(track.track_uri, 0, track.duration_ms, order)
        }
    }

    /// Full track duration, falling back to the stop marker when unknown.
    pub fn effective_duration_ms(&self) -> u64 {
        self.duration_ms.unwrap_or(self.stop_position_ms)
    }

    pub fn trim_range_display(&self) -> String {
        format!(
            "{} – {}",
            format_time(self.start_position_ms),
            format_time(self.stop_position_ms)
        )
    }

    /// Sequence order: ascending `order`, ties broken by `id`.
    pub fn sequence_cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

pub fn format_time(ms: u64) -> String {
    let total_seconds = ms / 1000;
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// Sort clips into playback order.
pub fn sort_clips(mut clips: Vec<ClipRecord>) -> Vec<ClipRecord> {
    clips.sort_by(ClipRecord::sequence_cmp);
    clips
}

/// Ordered clip collection persisted as a JSON array.
#[derive(Clone, Debug)]
pub struct ClipFile {
    path: PathBuf,
}

impl ClipFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every clip. A missing file is an empty collection.
    pub fn load(&self) -> Result<Vec<ClipRecord>> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Clip file not found, starting empty");
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let clips: Vec<ClipRecord> = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        tracing::info!(count = clips.len(), path = %self.path.display(), "Loaded clips");
        Ok(clips)
    }

    /// Overwrite the file with `clips`, creating its directory if needed.
    pub fn save(&self, clips: &[ClipRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(clips)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("writing {}", self.path.display()))?;
        tracing::info!(count = clips.len(), path = %self.path.display(), "Saved clips");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(order: i64, id: u128) -> ClipRecord {
        ClipRecord {
            id: Uuid::from_u128(id),
            ..ClipRecord::new("spotify:track:x", 0, 1000, order)
        }
    }

    #[test]
    fn sort_uses_order_then_id() {
        let sorted = sort_clips(vec![clip(2, 1), clip(1, 9), clip(1, 3)]);
        let ids: Vec<u128> = sorted.iter().map(|c| c.id.as_u128()).collect();
        assert_eq!(ids, vec![3, 9, 1]);
    }

    #[test]
    fn duration_falls_back_to_stop() {
        let mut c = ClipRecord::new("spotify:track:x", 1000, 45_000, 0);
        assert_eq!(c.effective_duration_ms(), 45_000);
        c.duration_ms = Some(180_000);
        assert_eq!(c.effective_duration_ms(), 180_000);
    }

    #[test]
    fn trim_range_formats_minutes_and_seconds() {
        let c = ClipRecord::new("spotify:track:x", 5_000, 125_900, 0);
        assert_eq!(c.trim_range_display(), "0:05 – 2:05");
    }

    #[test]
    fn clip_file_parses_json_and_defaults() {
        let dir = std::env::temp_dir().join(format!("loop-deck-clips-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clips.json");
        std::fs::write(
            &path,
            r#"[{"id":"00000000-0000-0000-0000-000000000001","track_uri":"spotify:track:a",
                "track_name":"A","artist_name":"X","stop_position_ms":30000,"order":0}]"#,
        )
        .unwrap();

        let clips = ClipFile::new(&path).load().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].start_position_ms, 0);
        assert_eq!(clips[0].duration_ms, None);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn track_clip_spans_whole_track() {
        let track = TrackInfo {
            track_uri: "spotify:track:a".into(),
            track_name: "Song".into(),
            artist_name: "Band".into(),
            duration_ms: 212_000,
        };
        let c = ClipRecord::from_track(track, 3);
        assert_eq!((c.start_position_ms, c.stop_position_ms), (0, 212_000));
        assert_eq!(c.duration_ms, Some(212_000));
        assert_eq!(c.order, 3);
        assert_eq!(c.track_name, "Song");
    }

    #[test]
    fn saved_clips_load_back() {
        let dir = std::env::temp_dir().join(format!("loop-deck-save-{}", Uuid::new_v4()));
        let file = ClipFile::new(dir.join("nested").join("clips.json"));
        let mut first = ClipRecord::new("spotify:track:a", 1_000, 30_000, 0);
        first.track_name = "A".into();
        let clips = vec![first, ClipRecord::new("spotify:track:b", 0, 20_000, 1)];

        file.save(&clips).unwrap();
        assert_eq!(file.load().unwrap(), clips);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_clip_file_is_empty() {
        let path = std::env::temp_dir().join(format!("loop-deck-missing-{}.json", Uuid::new_v4()));
        assert!(ClipFile::new(path).load().unwrap().is_empty());
    }
}
