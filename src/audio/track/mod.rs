// Per-stream state: playback tracks, record tracks, and the virtual output
// tracks that bridge duplicating endpoints into downstream mixers.

pub mod playback;
pub mod record;

pub(crate) mod output_track;

pub use playback::{Track, TrackFeed};
pub use record::{RecordTrack, RecordTrackFeed};

pub(crate) use output_track::OutputTrack;

use std::sync::atomic::{AtomicU8, Ordering};

/// Track lifecycle. `Stopping` is the drain phase between a stop request on
/// an active track and the thread observing its ring run dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TrackState {
    Idle,
    Active,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Flushed,
    Terminated,
}

impl TrackState {
    fn from_u8(v: u8) -> TrackState {
        match v {
            0 => TrackState::Idle,
            1 => TrackState::Active,
            2 => TrackState::Pausing,
            3 => TrackState::Paused,
            4 => TrackState::Resuming,
            5 => TrackState::Stopping,
            6 => TrackState::Stopped,
            7 => TrackState::Flushed,
            _ => TrackState::Terminated,
        }
    }
}

/// Atomic cell for a [`TrackState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: TrackState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> TrackState {
        TrackState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: TrackState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Fill-up discipline for freshly started tracks: no mixing until the ring
/// holds a full buffer (or the client forces readiness), one `Filled` cycle
/// to pick ramped vs instant volume, then steady-state `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FillStatus {
    Filling,
    Filled,
    Active,
}

#[derive(Debug)]
pub(crate) struct FillCell(AtomicU8);

impl FillCell {
    pub fn new(status: FillStatus) -> Self {
        FillCell(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> FillStatus {
        match self.0.load(Ordering::Acquire) {
            0 => FillStatus::Filling,
            1 => FillStatus::Filled,
            _ => FillStatus::Active,
        }
    }

    pub fn set(&self, status: FillStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Track flag bits.
pub(crate) const STEPSERVER_FAILED: u32 = 1;
