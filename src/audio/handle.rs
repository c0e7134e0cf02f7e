// Thin client-side handles. In a multi-process deployment these would sit
// behind the RPC boundary; here they are the boundary: dropping a handle is
// how a client gives its stream back to the server.

use std::sync::Arc;

use crate::audio::control_block::ControlBlock;
use crate::audio::track::{RecordTrack, Track, TrackState};
use crate::audio::types::AudioResult;

/// Client handle for a playback track.
#[derive(Debug)]
pub struct TrackHandle {
    track: Arc<Track>,
}

impl TrackHandle {
    pub(crate) fn new(track: Arc<Track>) -> Self {
        TrackHandle { track }
    }

    pub fn start(&self) -> AudioResult<()> {
        self.track.start()
    }

    pub fn stop(&self) {
        self.track.stop();
    }

    pub fn pause(&self) {
        self.track.pause();
    }

    pub fn flush(&self) -> AudioResult<()> {
        self.track.flush()
    }

    pub fn mute(&self, muted: bool) {
        self.track.mute(muted);
    }

    pub fn set_volume(&self, left: f32, right: f32) {
        self.track.set_volume(left, right);
    }

    pub fn state(&self) -> TrackState {
        self.track.state()
    }

    /// The shared control block; a real client maps this and runs the
    /// producer protocol itself.
    pub fn control_block(&self) -> Arc<ControlBlock> {
        self.track.control_block()
    }

    /// Non-blocking producer write; returns frames accepted.
    pub fn write(&self, pcm: &[i16]) -> usize {
        self.track.control_block().write_frames(pcm)
    }

    /// Blocking producer write with the canonical bounded wait.
    pub fn write_blocking(&self, pcm: &[i16]) -> AudioResult<usize> {
        self.track.control_block().write_frames_blocking(pcm)
    }

    /// Preempt the fill-up gate so a short clip starts immediately.
    pub fn force_ready(&self) {
        self.track.control_block().set_force_ready();
    }

    /// Early-wrap point for static one-shot clips.
    pub fn set_loop_end(&self, frame: u32) {
        self.track.control_block().set_loop_end(frame);
    }

    pub fn clear_loop(&self) {
        self.track.control_block().clear_loop();
    }

    pub fn frame_count(&self) -> u32 {
        self.track.control_block().frame_count()
    }

    /// Underrun indicator as seen by the client.
    pub fn flow_control_flag(&self) -> bool {
        self.track.control_block().flow_control_flag()
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        // the track object outlives the handle only until the endpoint
        // thread acknowledges the terminal state
        self.track.destroy();
    }
}

/// Client handle for a record stream.
pub struct RecordHandle {
    track: Arc<RecordTrack>,
}

impl RecordHandle {
    pub(crate) fn new(track: Arc<RecordTrack>) -> Self {
        RecordHandle { track }
    }

    pub fn start(&self) -> AudioResult<()> {
        self.track.start()
    }

    pub fn stop(&self) {
        self.track.stop();
    }

    pub fn state(&self) -> TrackState {
        self.track.state()
    }

    pub fn control_block(&self) -> Arc<ControlBlock> {
        self.track.control_block()
    }

    /// Non-blocking consumer read; returns frames delivered.
    pub fn read(&self, pcm: &mut [i16]) -> usize {
        self.track.control_block().read_frames(pcm)
    }

    /// Blocking consumer read with the canonical bounded wait.
    pub fn read_blocking(&self, pcm: &mut [i16]) -> AudioResult<usize> {
        self.track.control_block().read_frames_blocking(pcm)
    }

    pub fn has_overflowed(&self) -> bool {
        self.track.has_overflowed()
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        self.track.stop();
    }
}
