// Hardware abstraction: one device object opens blocking stream sinks and
// sources. Real-time threads talk only to these traits; everything behind
// them (pacing, rings, OS callbacks) is a backend concern.

pub mod null;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

use std::sync::Arc;

use crate::audio::params::ParameterMap;
use crate::audio::types::{AudioMode, AudioResult, EndpointConfig, SampleFormat};

/// Blocking playback sink bound to one hardware stream. `write` consumes
/// whole interleaved frames and returns only when the device has accepted
/// them; that blocking is what paces a playback thread.
pub trait StreamOut: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u32;
    fn format(&self) -> SampleFormat;
    /// Bytes per frame as presented to clients.
    fn frame_size(&self) -> usize {
        self.channel_count() as usize * 2
    }
    /// Device buffer size in bytes; one period.
    fn buffer_size(&self) -> usize;
    fn latency_ms(&self) -> u32;
    /// Blocking write; returns samples accepted.
    fn write(&self, samples: &[i16]) -> AudioResult<usize>;
    /// Enter low-power state until the next write.
    fn standby(&self);
    /// Hardware volume, normalized [0, 1]; used by the direct path.
    fn set_volume(&self, left: f32, right: f32) -> AudioResult<()>;
    fn set_parameters(&self, params: &ParameterMap) -> AudioResult<()>;
    fn get_parameters(&self, keys: &[&str]) -> ParameterMap;
}

/// Blocking capture source, symmetric to [`StreamOut`].
pub trait StreamIn: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u32;
    fn format(&self) -> SampleFormat;
    fn frame_size(&self) -> usize {
        self.channel_count() as usize * 2
    }
    fn buffer_size(&self) -> usize;
    /// Blocking read; returns samples delivered.
    fn read(&self, samples: &mut [i16]) -> AudioResult<usize>;
    fn standby(&self);
    fn set_parameters(&self, params: &ParameterMap) -> AudioResult<()>;
    fn get_parameters(&self, keys: &[&str]) -> ParameterMap;
}

/// Top-level hardware device.
pub trait AudioHwDevice: Send + Sync {
    fn init_check(&self) -> AudioResult<()>;
    fn set_mode(&self, mode: AudioMode) -> AudioResult<()>;
    /// Returns Ok if the hardware scales master volume itself; an error
    /// moves the scaling into the software mixer.
    fn set_master_volume(&self, volume: f32) -> AudioResult<()>;
    fn set_voice_volume(&self, volume: f32) -> AudioResult<()>;
    fn set_mic_mute(&self, muted: bool) -> AudioResult<()>;
    fn mic_mute(&self) -> bool;
    fn set_parameters(&self, params: &ParameterMap) -> AudioResult<()>;
    fn get_parameters(&self, keys: &[&str]) -> ParameterMap;
    fn open_output_stream(&self, config: &EndpointConfig) -> AudioResult<Arc<dyn StreamOut>>;
    fn open_input_stream(&self, config: &EndpointConfig) -> AudioResult<Arc<dyn StreamIn>>;
    /// Suggested record buffer size in bytes for the given configuration.
    fn input_buffer_size(&self, sample_rate: u32, format: SampleFormat, channels: u32) -> usize;
}
