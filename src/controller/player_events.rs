//! Event dispatch for the engine loop

use super::session::SessionOutcome;
use super::{Engine, EngineCommand, EngineEvent};

impl Engine {
    /// Apply one event. Returns `false` once the engine should stop.
    pub(super) fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Command(command) => return self.handle_command(command),
            EngineEvent::Device { epoch, event } => {
                tracing::trace!(epoch, ?event, "Device event");
                let outcome = self.session.on_device_event(epoch, event);
                self.apply_outcome(outcome);
            }
            EngineEvent::AuthCompleted(result) => {
                let outcome = self.session.on_auth_completed(result);
                self.apply_outcome(outcome);
            }
            EngineEvent::ReconnectDue { generation } => {
                self.session.on_reconnect_due(generation);
            }
            EngineEvent::SeekDue {
                generation,
                position_ms,
            } => {
                self.sequencer
                    .on_seek_due(generation, position_ms, &self.session);
            }
            EngineEvent::PollResult {
                generation,
                play_epoch,
                result,
            } => {
                if let Some(snapshot) = self.poller.on_poll_result(generation, result) {
                    self.apply_snapshot(snapshot, play_epoch);
                }
            }
            EngineEvent::CommandFailed {
                epoch,
                command,
                message,
            } => {
                let outcome = self.session.on_command_failed(epoch, &command, &message);
                self.apply_outcome(outcome);
            }
        }
        true
    }

    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Authorize(reply) => {
                let _ = reply.send(self.session.authorize());
            }
            EngineCommand::AuthCallback { payload, reply } => {
                let _ = reply.send(self.session.handle_auth_callback(&payload));
            }
            EngineCommand::Connect => self.session.connect(),
            EngineCommand::Disconnect => {
                let outcome = self.session.disconnect();
                self.apply_outcome(outcome);
            }
            EngineCommand::ReconnectIfNeeded => self.session.reconnect_if_needed(),
            EngineCommand::LoadClips(clips) => {
                self.sequencer.reload_clips(clips);
                self.update_clip_start();
            }
            EngineCommand::PlayFromIndex(index) => {
                self.sequencer.play_from_index(index, &self.session);
                self.update_clip_start();
            }
            EngineCommand::PlayNext => {
                self.sequencer.play_next(&self.session);
                self.update_clip_start();
            }
            EngineCommand::PlayPrevious => {
                self.sequencer.play_previous(&self.session);
                self.update_clip_start();
            }
            EngineCommand::TogglePlayPause => {
                let snapshot = self.poller.current_snapshot();
                self.sequencer
                    .toggle_play_pause(snapshot.as_ref(), &self.session);
            }
            EngineCommand::Stop => {
                self.sequencer.stop(&self.session);
                self.update_clip_start();
            }
            EngineCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn apply_outcome(&mut self, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Unchanged => {}
            SessionOutcome::Connected(device) => {
                let play_epoch = self.sequencer.subscribe_play_epoch();
                self.poller.start(device, play_epoch);
            }
            // The last snapshot stays readable but goes stale.
            SessionOutcome::Disconnected => self.poller.stop(),
            // Pushed state is current as of delivery.
            SessionOutcome::State(snapshot) => {
                let snapshot = self.poller.on_push(snapshot);
                let play_epoch = self.sequencer.play_epoch();
                self.apply_snapshot(snapshot, play_epoch);
            }
        }
    }
}
