//! Clip sequencing: user intent to device commands, plus auto-advance

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::EngineEvent;
use super::timer::TimerSlot;
use crate::model::{ClipRecord, PlaybackCursor, PlayerCommand, PlayerStateSnapshot, sort_clips};

/// Where the sequencer sends its commands.
pub trait CommandSink {
    fn is_connected(&self) -> bool;

    /// Fire-and-forget. Failures come back to the engine separately.
    fn issue(&self, command: PlayerCommand);
}

/// Published view of the sequencer for display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequencerStatus {
    pub current_index: Option<usize>,
    pub current_clip: Option<ClipRecord>,
    pub is_playing: bool,
    pub clip_count: usize,
    pub can_go_next: bool,
    pub can_go_previous: bool,
}

pub struct PlaybackSequencer {
    clips: Vec<ClipRecord>,
    cursor: PlaybackCursor,
    is_playing: bool,
    seek_timer: TimerSlot,
    seek_delay: Duration,
    stop_buffer_ms: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Sender<SequencerStatus>,
    /// Bumped whenever a play or its seek is issued. Snapshots fetched under
    /// an older value describe the device before that command.
    play_epoch: watch::Sender<u64>,
}

impl PlaybackSequencer {
    pub fn new(
        seek_delay: Duration,
        stop_buffer_ms: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            clips: Vec::new(),
            cursor: PlaybackCursor::default(),
            is_playing: false,
            seek_timer: TimerSlot::new(),
            seek_delay,
            stop_buffer_ms,
            events,
            status: watch::channel(SequencerStatus::default()).0,
            play_epoch: watch::channel(0).0,
        }
    }

    // ========================================================================
    // Clip sequence
    // ========================================================================

    /// Replace the cached sequence. The cursor is left alone.
    pub fn load_clips(&mut self, clips: Vec<ClipRecord>) {
        self.replace_clips(clips);
        self.publish();
    }

    fn replace_clips(&mut self, clips: Vec<ClipRecord>) {
        self.clips = sort_clips(clips);
        tracing::debug!(count = self.clips.len(), "Clips loaded");
    }

    /// Replace the sequence and follow the current record to its new index.
    /// The cursor is cleared when that record is gone.
    pub fn reload_clips(&mut self, clips: Vec<ClipRecord>) {
        let current_id = self.current_clip().map(|clip| clip.id);
        self.replace_clips(clips);

        if self.cursor.current_index.is_none() {
            self.publish();
            return;
        }
        match current_id.and_then(|id| self.clips.iter().position(|clip| clip.id == id)) {
            Some(index) => {
                self.cursor.current_index = Some(index);
            }
            None => {
                tracing::info!("Current clip removed, clearing cursor");
                self.cursor.clear();
                self.is_playing = false;
                self.seek_timer.cancel();
            }
        }
        self.publish();
    }

    pub fn current_clip(&self) -> Option<&ClipRecord> {
        self.cursor.current_index.and_then(|i| self.clips.get(i))
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn can_go_next(&self) -> bool {
        self.cursor
            .current_index
            .is_some_and(|i| i + 1 < self.clips.len())
    }

    /// At the first clip, previous replays it.
    pub fn can_go_previous(&self) -> bool {
        self.cursor.current_index.is_some() && !self.clips.is_empty()
    }

    pub fn seek_pending(&self) -> bool {
        self.seek_timer.is_pending()
    }

    pub fn subscribe(&self) -> watch::Receiver<SequencerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SequencerStatus {
        self.status.borrow().clone()
    }

    pub fn play_epoch(&self) -> u64 {
        *self.play_epoch.borrow()
    }

    pub fn subscribe_play_epoch(&self) -> watch::Receiver<u64> {
        self.play_epoch.subscribe()
    }

    fn bump_play_epoch(&self) {
        self.play_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Only an index that points at a clip is ever published.
    fn publish(&self) {
        let current_clip = self.current_clip().cloned();
        self.status.send_replace(SequencerStatus {
            current_index: current_clip.as_ref().and(self.cursor.current_index),
            current_clip,
            is_playing: self.is_playing,
            clip_count: self.clips.len(),
            can_go_next: self.can_go_next(),
            can_go_previous: self.can_go_previous(),
        });
    }

    // ========================================================================
    // Transport
    // ========================================================================

    pub fn play_from_index(&mut self, index: usize, sink: &impl CommandSink) -> bool {
        let Some(clip) = self.clips.get(index) else {
            tracing::debug!(index, count = self.clips.len(), "Play index out of bounds");
            return false;
        };
        if !sink.is_connected() {
            tracing::debug!(index, "Not connected, ignoring play");
            return false;
        }

        let track_uri = clip.track_uri.clone();
        let start = clip.start_position_ms;
        tracing::info!(index, track = %clip.track_name, uri = %track_uri, start, "Playing clip");

        self.cursor.point_at(index);
        self.is_playing = true;
        self.bump_play_epoch();
        sink.issue(PlayerCommand::Play(track_uri));
        self.seek_timer.schedule(self.seek_delay, &self.events, |generation| {
            EngineEvent::SeekDue {
                generation,
                position_ms: start,
            }
        });
        self.publish();
        true
    }

    /// Second half of the play choreography.
    pub fn on_seek_due(&mut self, generation: u64, position_ms: u64, sink: &impl CommandSink) {
        if !self.seek_timer.fire(generation) {
            return;
        }
        if self.cursor.current_index.is_none() {
            return;
        }
        tracing::debug!(position_ms, "Seeking to clip start");
        self.bump_play_epoch();
        sink.issue(PlayerCommand::Seek(position_ms));
    }

    pub fn play_next(&mut self, sink: &impl CommandSink) {
        match self.cursor.current_index {
            Some(i) if i + 1 < self.clips.len() => {
                self.play_from_index(i + 1, sink);
            }
            Some(_) => {
                tracing::info!("Reached end of clip sequence");
                self.stop(sink);
            }
            None => {}
        }
    }

    pub fn play_previous(&mut self, sink: &impl CommandSink) {
        if let Some(i) = self.cursor.current_index {
            self.play_from_index(i.saturating_sub(1), sink);
        }
    }

    pub fn toggle_play_pause(&mut self, snapshot: Option<&PlayerStateSnapshot>, sink: &impl CommandSink) {
        let Some(snapshot) = snapshot else {
            tracing::debug!("No snapshot, ignoring toggle");
            return;
        };
        if snapshot.is_paused {
            sink.issue(PlayerCommand::Resume);
            self.is_playing = true;
        } else {
            sink.issue(PlayerCommand::Pause);
            self.is_playing = false;
        }
        self.publish();
    }

    pub fn stop(&mut self, sink: &impl CommandSink) {
        self.seek_timer.cancel();
        self.cursor.clear();
        self.is_playing = false;
        sink.issue(PlayerCommand::Pause);
        self.publish();
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// `observed_epoch` is the play epoch at the time the snapshot was
    /// requested from the device.
    pub fn on_snapshot(
        &mut self,
        snapshot: &PlayerStateSnapshot,
        observed_epoch: u64,
        sink: &impl CommandSink,
    ) {
        if observed_epoch != self.play_epoch() {
            tracing::trace!(
                observed_epoch,
                current = self.play_epoch(),
                "Snapshot predates the last play, skipping"
            );
            return;
        }
        self.sync_playing_state(snapshot);
        self.check_boundary(snapshot, sink);
    }

    fn sync_playing_state(&mut self, snapshot: &PlayerStateSnapshot) {
        if self.cursor.current_index.is_none() {
            return;
        }
        // While the seek is pending the device may still report the old track.
        if self.seek_timer.is_pending() {
            return;
        }
        let playing = !snapshot.is_paused;
        if playing != self.is_playing {
            tracing::debug!(playing, "Playing state changed on device");
            self.is_playing = playing;
            self.publish();
        }
    }

    fn check_boundary(&mut self, snapshot: &PlayerStateSnapshot, sink: &impl CommandSink) {
        if !self.is_playing || self.cursor.has_reached_stop_boundary {
            return;
        }
        if self.seek_timer.is_pending() {
            return;
        }
        let Some(clip) = self.current_clip() else {
            return;
        };
        if snapshot.is_other_track(&clip.track_uri) {
            return;
        }

        let boundary = clip.stop_position_ms.saturating_sub(self.stop_buffer_ms);
        if snapshot.position_ms < boundary {
            return;
        }

        tracing::info!(
            position_ms = snapshot.position_ms,
            stop_ms = clip.stop_position_ms,
            "Clip reached stop boundary"
        );
        self.cursor.has_reached_stop_boundary = true;
        sink.issue(PlayerCommand::Pause);
        self.play_next(sink);
    }
}
