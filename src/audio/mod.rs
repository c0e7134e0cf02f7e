// Audio engine, broken into logical components:
// - types/params/events: core data types, parameter strings, notifications
// - control_block: the shared producer/consumer ring contract
// - mixer: pull providers, resampler, and the software mix pipeline
// - hardware: device abstraction plus the null and cpal backends
// - track: playback/record/output track state machines
// - threads: the per-endpoint real-time loops
// - server: registry, routing, and the client-facing surface

pub mod client;
pub mod control_block;
pub mod events;
pub mod handle;
pub mod hardware;
pub mod mixer;
pub mod params;
pub mod server;
pub mod threads;
pub mod track;
pub mod types;

// Re-export commonly used types for easier imports
pub use client::Client;
pub use control_block::ControlBlock;
pub use events::{IoConfigEvent, IoNotification};
pub use handle::{RecordHandle, TrackHandle};
pub use hardware::{AudioHwDevice, StreamIn, StreamOut};
pub use mixer::{AudioBuffer, AudioBufferProvider, LinearResampler};
pub use params::ParameterMap;
pub use server::AudioServer;
pub use threads::{PlaybackKind, PlaybackThread, RecordThread};
pub use track::{RecordTrack, Track, TrackState};
pub use types::{
    output_flags, AudioError, AudioMode, AudioResult, EndpointConfig, EndpointId,
    OutputDescriptor, PlaybackMetrics, Pid, SampleFormat, StreamType,
};
