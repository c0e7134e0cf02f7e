use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint handle issued monotonically by the server. 0 is never issued and
/// means "global" where an endpoint argument is optional.
pub type EndpointId = u32;

/// Client process identifier.
pub type Pid = u32;

/// Maximum software mixer gain, Q4.12. Numerically equal to unity: effective
/// track gain is clamped at 1.0, there is no boost headroom.
pub const MAX_GAIN: f32 = 4096.0;
/// Unity gain in the Q4.12 volume encoding used by the control block.
pub const UNITY_GAIN: u16 = 0x1000;

/// Mixer track slots per output endpoint.
pub const MAX_MIXER_TRACKS: usize = 32;

/// Retry budget for a track that is ready to mix but has no frames.
/// Startup gets a larger budget so a slow client survives its fill-up.
pub const MAX_TRACK_RETRIES: i32 = 25;
pub const MAX_TRACK_STARTUP_RETRIES: i32 = 50;

/// Pending buffers an OutputTrack may queue against a stalled destination
/// before overflow is dropped.
pub const MAX_OVERFLOW_BUFFERS: usize = 8;

/// Recovery sleep when nothing was ready to mix; doubles by addition up to
/// the cap. The device zero-fills on its own if we drift.
pub const BUFFER_RECOVERY: Duration = Duration::from_millis(2);
pub const MAX_BUFFER_RECOVERY: Duration = Duration::from_millis(20);

/// Inactivity window after which an endpoint is placed in standby.
pub const STANDBY_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on control-block condition-variable waits.
pub const CBLK_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Back-off when a record client is not draining its ring.
pub const RECORD_OVERFLOW_BACKOFF: Duration = Duration::from_millis(5);
/// Sleep after an input device read error before retrying.
pub const RECORD_READ_ERROR_SLEEP: Duration = Duration::from_secs(1);

/// Shared-memory arena budget per client process. 1 MiB is good for about
/// 32 tracks of 8 x 4 KiB buffers.
pub const CLIENT_ARENA_BYTES: usize = 1024 * 1024;

/// Environment variable checked once on wake from standby; when set, master
/// mute is asserted and cannot be undone from that path.
pub const SILENT_MODE_ENV: &str = "MIXSERVE_SILENT";

/// Retries and interval for the diagnostic dump try-lock.
pub const DUMP_LOCK_RETRIES: usize = 50;
pub const DUMP_LOCK_SLEEP: Duration = Duration::from_millis(20);

/// PCM sample formats carried by tracks. Everything internal is 16-bit;
/// 8-bit clients up-convert before writing so their control-block frame
/// size is computed as if 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Pcm16,
    Pcm8,
}

impl SampleFormat {
    pub fn is_linear_pcm(self) -> bool {
        matches!(self, SampleFormat::Pcm16 | SampleFormat::Pcm8)
    }

    /// Bytes per sample as stored in a track ring (8-bit data is widened by
    /// the client before it reaches the ring).
    pub fn ring_bytes_per_sample(self) -> usize {
        2
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::Pcm16
    }
}

/// Stream categories with independent volume/mute and routing. `Bridge` is
/// the hidden type used by duplicating endpoints to feed downstream mixers;
/// clients cannot create tracks of that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
    BluetoothSco,
    EnforcedAudible,
    Bridge,
}

impl StreamType {
    /// All types including the internal bridge slot.
    pub const COUNT: usize = 9;
    /// Types a client may request.
    pub const CLIENT_COUNT: usize = 8;

    pub fn index(self) -> usize {
        match self {
            StreamType::VoiceCall => 0,
            StreamType::System => 1,
            StreamType::Ring => 2,
            StreamType::Music => 3,
            StreamType::Alarm => 4,
            StreamType::Notification => 5,
            StreamType::BluetoothSco => 6,
            StreamType::EnforcedAudible => 7,
            StreamType::Bridge => 8,
        }
    }

    pub fn is_client_type(self) -> bool {
        self.index() < Self::CLIENT_COUNT
    }
}

/// Telephony-style device mode; forwarded to the hardware device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioMode {
    Normal,
    Ringtone,
    InCall,
}

/// Per-stream-type volume state held by the server and mirrored into each
/// playback thread.
#[derive(Debug, Clone, Copy)]
pub struct StreamVolume {
    pub volume: f32,
    pub mute: bool,
}

impl Default for StreamVolume {
    fn default() -> Self {
        StreamVolume {
            volume: 1.0,
            mute: false,
        }
    }
}

/// Requested configuration for opening an endpoint. `None` fields let the
/// hardware pick; the descriptor reported back carries the actual values.
/// `acoustics` is an input-only processing hint passed through to the
/// hardware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub devices: u32,
    pub sample_rate: Option<u32>,
    pub format: Option<SampleFormat>,
    pub channel_count: Option<u32>,
    pub latency_ms: Option<u32>,
    #[serde(default)]
    pub acoustics: u32,
}

/// Open-flags for output endpoints.
pub mod output_flags {
    /// Bypass the software mixer; the track feeds the device directly.
    pub const DIRECT: u32 = 1;
}

/// Snapshot of an endpoint's negotiated parameters, delivered with config
/// events and queried through the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub sample_rate: u32,
    pub channel_count: u32,
    pub format: SampleFormat,
    pub frame_count: usize,
    pub latency_ms: u32,
}

/// Errors surfaced at the API boundary. Real-time threads never return
/// these upward; they degrade instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("audio hardware not initialized")]
    NotInitialized,
    #[error("shared control block allocation failed")]
    NoMemory,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid operation in current state")]
    InvalidOperation,
    #[error("unknown endpoint {0}")]
    BadIndex(EndpointId),
    #[error("not enough data")]
    NotEnoughData,
    #[error("endpoint busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("hardware error: {0}")]
    Hardware(&'static str),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Write/underrun statistics kept per playback thread, snapshot through
/// `dump()`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PlaybackMetrics {
    pub total_writes: u64,
    pub delayed_writes: u64,
    pub bytes_written: u64,
    pub standby: bool,
    pub active_tracks: usize,
    pub tracks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_type_indices_are_dense() {
        let all = [
            StreamType::VoiceCall,
            StreamType::System,
            StreamType::Ring,
            StreamType::Music,
            StreamType::Alarm,
            StreamType::Notification,
            StreamType::BluetoothSco,
            StreamType::EnforcedAudible,
            StreamType::Bridge,
        ];
        for (i, s) in all.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
        assert_eq!(all.len(), StreamType::COUNT);
        assert!(!StreamType::Bridge.is_client_type());
    }

    #[test]
    fn eight_bit_frames_are_sized_as_sixteen() {
        assert_eq!(SampleFormat::Pcm8.ring_bytes_per_sample(), 2);
    }
}
