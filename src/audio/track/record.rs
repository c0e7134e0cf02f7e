// Record track: the capture-side twin of a playback track. The record
// thread produces into the ring at the server cursor; the client drains at
// the user cursor through the handle helpers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::audio::client::Client;
use crate::audio::control_block::ControlBlock;
use crate::audio::mixer::provider::{AudioBuffer, AudioBufferProvider};
use crate::audio::threads::record::RecordThread;
use crate::audio::types::{AudioError, AudioResult, SampleFormat};

use super::{StateCell, TrackState, STEPSERVER_FAILED};

const CBLK_OVERHEAD_BYTES: usize = 128;

pub struct RecordTrack {
    thread: Weak<RecordThread>,
    #[allow(dead_code)]
    client: Arc<Client>,
    pub(crate) cblk: Arc<ControlBlock>,
    format: SampleFormat,
    arena_bytes: usize,

    state: StateCell,
    overflow: AtomicBool,
    flags: AtomicU32,
    pending_step: AtomicU32,
}

impl RecordTrack {
    pub(crate) fn new(
        thread: &Arc<RecordThread>,
        client: Arc<Client>,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
    ) -> AudioResult<Arc<RecordTrack>> {
        let ring_bytes =
            frame_count as usize * channel_count as usize * format.ring_bytes_per_sample();
        let arena_bytes = CBLK_OVERHEAD_BYTES + ring_bytes;
        client.allocate(arena_bytes)?;

        let cblk = ControlBlock::new_in(frame_count, sample_rate, channel_count, format);
        Ok(Arc::new(RecordTrack {
            thread: Arc::downgrade(thread),
            client,
            cblk: Arc::new(cblk),
            format,
            arena_bytes,
            state: StateCell::new(TrackState::Idle),
            overflow: AtomicBool::new(false),
            flags: AtomicU32::new(flags & !STEPSERVER_FAILED),
            pending_step: AtomicU32::new(0),
        }))
    }

    pub fn control_block(&self) -> Arc<ControlBlock> {
        self.cblk.clone()
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channel_count(&self) -> u32 {
        self.cblk.channel_count()
    }

    pub fn state(&self) -> TrackState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TrackState) {
        self.state.set(state);
    }

    /// Start is synchronous: blocks until the record thread acknowledges.
    pub fn start(self: &Arc<Self>) -> AudioResult<()> {
        let thread = self.thread.upgrade().ok_or(AudioError::NotInitialized)?;
        thread.start(self)
    }

    /// Stop is synchronous as well; afterwards the ring is reset and the
    /// overrun gate re-armed so the first fresh read sees clean state.
    pub fn stop(self: &Arc<Self>) {
        if let Some(thread) = self.thread.upgrade() {
            thread.stop(self);
            self.cblk.reset();
        }
    }

    /// Flag an overrun; false if one was already pending.
    pub(crate) fn set_overflow(&self) -> bool {
        if self.overflow.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cblk.raise_flow_control();
        true
    }

    pub(crate) fn clear_overflow(&self) {
        self.overflow.store(false, Ordering::Relaxed);
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

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

impl Drop for RecordTrack {
    fn drop(&mut self) {
        self.client.release(self.arena_bytes);
    }
}

/// Producer-side pull adapter: hands the record thread writable regions of
/// the track ring at the server cursor.
pub struct RecordTrackFeed {
    track: Arc<RecordTrack>,
}

impl RecordTrackFeed {
    pub fn new(track: Arc<RecordTrack>) -> Self {
        RecordTrackFeed { track }
    }
}

impl AudioBufferProvider for RecordTrackFeed {
    fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()> {
        let track = &self.track;
        let cblk = &track.cblk;

        if track.flags.load(Ordering::Acquire) & STEPSERVER_FAILED != 0 {
            if !track.step() {
                buffer.clear();
                return Err(AudioError::NotEnoughData);
            }
            track.flags.fetch_and(!STEPSERVER_FAILED, Ordering::AcqRel);
        }

        let avail = cblk.frames_available();
        if avail == 0 {
            buffer.clear();
            return Err(AudioError::NotEnoughData);
        }

        let s = cblk.server();
        let base = cblk.server_base();
        let contig = cblk.frame_count() - s.wrapping_sub(base).min(cblk.frame_count());
        let frames = (buffer.frame_count as u32).min(avail).min(contig);
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
