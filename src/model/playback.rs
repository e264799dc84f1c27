//! Playback cursor and display-position interpolation

use std::time::Instant;

use super::types::PlayerStateSnapshot;

/// The sequencer's belief about which clip is current.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub current_index: Option<usize>,
    /// One-shot latch, set when the current clip's stop boundary fired.
    pub has_reached_stop_boundary: bool,
}

impl PlaybackCursor {
    pub fn point_at(&mut self, index: usize) {
        self.current_index = Some(index);
        self.has_reached_stop_boundary = false;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Estimates the playback position between coarse polls.
///
/// Display only: it never issues commands or touches playback state.
#[derive(Clone, Copy, Debug)]
pub struct PositionInterpolator {
    last_known_position_ms: u64,
    last_sync: Instant,
    is_paused: bool,
    duration_ms: u64,
    clip_start_ms: u64,
    threshold_ms: u64,
}

impl PositionInterpolator {
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            last_known_position_ms: 0,
            last_sync: Instant::now(),
            is_paused: true,
            duration_ms: 0,
            clip_start_ms: 0,
            threshold_ms,
        }
    }

    /// Snap to a real position reported by the device.
    pub fn sync(&mut self, snapshot: &PlayerStateSnapshot, now: Instant) {
        self.last_known_position_ms = snapshot.position_ms;
        self.last_sync = now;
        self.is_paused = snapshot.is_paused;
        self.duration_ms = snapshot.duration_ms;
    }

    /// Set the start marker of the clip being displayed.
    pub fn set_clip_start(&mut self, start_ms: u64) {
        self.clip_start_ms = start_ms;
    }

    /// Until playback has moved past the clip start plus the threshold, a seek
    /// may still be in flight and projecting forward would jump backwards later.
    fn playback_has_started(&self) -> bool {
        !self.is_paused
            && self.last_known_position_ms >= self.clip_start_ms.saturating_add(self.threshold_ms)
    }

    pub fn position_at(&self, now: Instant) -> u64 {
        if !self.playback_has_started() {
            return self.last_known_position_ms;
        }
        let elapsed = now.saturating_duration_since(self.last_sync).as_millis() as u64;
        self.last_known_position_ms
            .saturating_add(elapsed)
            .min(self.duration_ms)
    }
}
