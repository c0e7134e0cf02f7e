// Mixserve - process-wide audio mediation server
//
// Many client PCM streams in, a handful of hardware endpoints out (and the
// reverse for record). Clients produce into shared control-block rings; each
// endpoint owns one real-time thread that pulls, resamples, mixes and writes
// at the cadence the hardware demands.

pub mod audio;
pub mod log;

// Re-export the types most callers need.
pub use audio::{
    AudioError, AudioMode, AudioResult, AudioServer, ControlBlock, EndpointConfig, EndpointId,
    IoConfigEvent, IoNotification, OutputDescriptor, ParameterMap, RecordHandle, SampleFormat,
    StreamType, TrackHandle, TrackState,
};

pub use audio::hardware::{null::NullAudioHw, AudioHwDevice, StreamIn, StreamOut};
