// Playback track: one client stream attached to an output endpoint. The
// track owns the shared control block; the thread consumes it through the
// pull contract via [`TrackFeed`].

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::warn;

use crate::audio::client::Client;
use crate::audio::control_block::ControlBlock;
use crate::audio::mixer::provider::{AudioBuffer, AudioBufferProvider};
use crate::audio::threads::playback::PlaybackThread;
use crate::audio::types::{
    AudioError, AudioResult, SampleFormat, StreamType, MAX_GAIN, UNITY_GAIN,
};

use super::{FillCell, FillStatus, StateCell, TrackState, STEPSERVER_FAILED};

/// Control-block header overhead charged against the client arena alongside
/// the PCM ring.
const CBLK_OVERHEAD_BYTES: usize = 128;

pub struct Track {
    thread: RwLock<Weak<PlaybackThread>>,
    client: Option<Arc<Client>>,
    pub(crate) cblk: Arc<ControlBlock>,
    stream_type: StreamType,
    format: SampleFormat,
    shared_buffer: bool,
    arena_bytes: usize,

    name: AtomicUsize,
    state: StateCell,
    pub(crate) fill_status: FillCell,
    pub(crate) retry_count: AtomicI32,
    reset_done: AtomicBool,
    flags: AtomicU32,
    muted: AtomicBool,
    pending_step: AtomicU32,
}

impl Track {
    /// Create a track and charge its shared memory to the client arena.
    /// Called by the endpoint thread under the server and thread locks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        thread: &Arc<PlaybackThread>,
        client: Option<Arc<Client>>,
        stream_type: StreamType,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
        shared_buffer: Option<Vec<i16>>,
        name: usize,
    ) -> AudioResult<Arc<Track>> {
        let is_shared = shared_buffer.is_some();
        let ring_bytes = if is_shared {
            0
        } else {
            frame_count as usize * channel_count as usize * format.ring_bytes_per_sample()
        };
        let arena_bytes = CBLK_OVERHEAD_BYTES + ring_bytes;
        if let Some(client) = &client {
            client.allocate(arena_bytes)?;
        }

        let cblk = match shared_buffer {
            Some(data) => ControlBlock::new_static(data, sample_rate, channel_count, format),
            None => ControlBlock::new_out(frame_count, sample_rate, channel_count, format),
        };

        Ok(Arc::new(Track {
            thread: RwLock::new(Arc::downgrade(thread)),
            client,
            cblk: Arc::new(cblk),
            stream_type,
            format,
            shared_buffer: is_shared,
            arena_bytes,
            name: AtomicUsize::new(name),
            state: StateCell::new(TrackState::Idle),
            fill_status: FillCell::new(FillStatus::Filling),
            retry_count: AtomicI32::new(0),
            reset_done: AtomicBool::new(false),
            // client open flags live in the upper bits; the low bit is the
            // failed-step marker
            flags: AtomicU32::new(flags & !STEPSERVER_FAILED),
            muted: AtomicBool::new(false),
            pending_step: AtomicU32::new(0),
        }))
    }

    pub fn control_block(&self) -> Arc<ControlBlock> {
        self.cblk.clone()
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channel_count(&self) -> u32 {
        self.cblk.channel_count()
    }

    pub fn sample_rate(&self) -> u32 {
        self.cblk.sample_rate()
    }

    pub fn is_static(&self) -> bool {
        self.shared_buffer
    }

    pub fn state(&self) -> TrackState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TrackState) {
        self.state.set(state);
    }

    pub(crate) fn name(&self) -> usize {
        self.name.load(Ordering::Relaxed)
    }

    pub(crate) fn set_name(&self, name: usize) {
        self.name.store(name, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub(crate) fn upgrade_thread(&self) -> Option<Arc<PlaybackThread>> {
        self.thread.read().unwrap().upgrade()
    }

    pub(crate) fn rebind_thread(&self, thread: &Arc<PlaybackThread>) {
        *self.thread.write().unwrap() = Arc::downgrade(thread);
    }

    /// Fill-up gate: a freshly started track is not mixed until its ring
    /// holds a full buffer of frames or the client forces readiness. The
    /// one-cycle `Filled` acknowledgement picks ramped vs instant volume.
    pub(crate) fn is_ready(&self) -> bool {
        if self.fill_status.get() != FillStatus::Filling {
            return true;
        }
        if self.cblk.frames_ready() >= self.cblk.frame_count() || self.cblk.take_force_ready() {
            self.fill_status.set(FillStatus::Filled);
            return true;
        }
        false
    }

    /// Reset the ring once per stop; data written after a flush but before
    /// the thread notices must not be discarded twice.
    pub(crate) fn reset(&self) {
        if !self.reset_done.swap(true, Ordering::AcqRel) {
            self.cblk.reset();
            // clear engine-side flag bits, keep the client's open flags
            self.flags.fetch_and(!STEPSERVER_FAILED, Ordering::AcqRel);
            self.fill_status.set(FillStatus::Filling);
        }
    }

    pub(crate) fn clear_reset_done(&self) {
        self.reset_done.store(false, Ordering::Relaxed);
    }

    pub fn start(self: &Arc<Self>) -> AudioResult<()> {
        if self.state() == TrackState::Terminated {
            return Err(AudioError::InvalidOperation);
        }
        let thread = self.upgrade_thread().ok_or(AudioError::NotInitialized)?;
        thread.add_track(self);
        Ok(())
    }

    pub fn stop(self: &Arc<Self>) {
        if let Some(thread) = self.upgrade_thread() {
            thread.stop_track(self);
        }
    }

    pub fn pause(self: &Arc<Self>) {
        if let Some(thread) = self.upgrade_thread() {
            thread.pause_track(self);
        }
    }

    pub fn flush(self: &Arc<Self>) -> AudioResult<()> {
        if let Some(thread) = self.upgrade_thread() {
            thread.flush_track(self)
        } else {
            Err(AudioError::NotInitialized)
        }
    }

    /// Handle-drop path: detach from the endpoint; the object dies once the
    /// thread acknowledges.
    pub(crate) fn destroy(self: &Arc<Self>) {
        if let Some(thread) = self.upgrade_thread() {
            thread.destroy_track(self);
        } else {
            self.set_state(TrackState::Terminated);
        }
    }

    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Client gain as floats; stored Q4.12 in the control block where the
    /// mix loop reads it.
    pub fn set_volume(&self, left: f32, right: f32) {
        let q = |v: f32| (v.clamp(0.0, MAX_GAIN / UNITY_GAIN as f32) * UNITY_GAIN as f32) as u16;
        self.cblk.set_volume(q(left), q(right));
    }

    /// Retire the pending consumer step; on failure the failed-step flag
    /// makes the next fetch retry before pulling fresh frames.
    fn step(&self) -> bool {
        let frames = self.pending_step.load(Ordering::Relaxed);
        if self.cblk.try_step_server(frames) {
            true
        } else {
            self.flags.fetch_or(STEPSERVER_FAILED, Ordering::AcqRel);
            false
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        if let Some(client) = &self.client {
            client.release(self.arena_bytes);
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name())
            .field("stream_type", &self.stream_type)
            .field("state", &self.state())
            .field("ready", &self.cblk.frames_ready())
            .finish()
    }
}

/// Consumer-side pull adapter handed to the mixer.
pub struct TrackFeed {
    track: Arc<Track>,
}

impl TrackFeed {
    pub fn new(track: Arc<Track>) -> Self {
        TrackFeed { track }
    }

    /// Identity used to detect slot rebinding across cycles.
    pub(crate) fn source_id(track: &Arc<Track>) -> usize {
        Arc::as_ptr(track) as usize
    }
}

impl AudioBufferProvider for TrackFeed {
    fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()> {
        let track = &self.track;
        let cblk = &track.cblk;

        // a previously failed consumer step must land before new frames move
        if track.flags.load(Ordering::Acquire) & STEPSERVER_FAILED != 0 {
            if !track.step() {
                buffer.clear();
                return Err(AudioError::NotEnoughData);
            }
            track.flags.fetch_and(!STEPSERVER_FAILED, Ordering::AcqRel);
        }

        let ready = cblk.frames_ready();
        if ready == 0 {
            // underrun past fill-up re-arms the flow-control gate
            if track.fill_status.get() == FillStatus::Active {
                cblk.raise_flow_control();
            }
            buffer.clear();
            return Err(AudioError::NotEnoughData);
        }

        let s = cblk.server();
        let limit = cblk.server_fetch_limit();
        let frames = (buffer.frame_count as u32).min(ready).min(limit);
        if frames == 0 {
            buffer.clear();
            return Err(AudioError::NotEnoughData);
        }
        match cblk.server_region(s, frames) {
            Some(raw) => {
                buffer.raw = raw;
                buffer.frame_count = frames as usize;
                Ok(())
            }
            None => {
                warn!("track {} fetch refused: corrupted cursors", track.name());
                buffer.clear();
                Err(AudioError::NotEnoughData)
            }
        }
    }

    fn release_buffer(&mut self, buffer: &mut AudioBuffer) {
        self.track
            .pending_step
            .store(buffer.frame_count as u32, Ordering::Relaxed);
        self.track.step();
        buffer.clear();
    }
}
