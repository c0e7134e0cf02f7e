// Null hardware: a stub device that paces IO by wall clock (or not at all
// in instant mode), captures everything written, and synthesizes input
// signals. This is the backend the test suite and headless operation run
// against.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audio::params::{ParameterMap, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::audio::types::{AudioError, AudioMode, AudioResult, EndpointConfig, SampleFormat};

use super::{AudioHwDevice, StreamIn, StreamOut};

const DEFAULT_RATE: u32 = 44100;
const DEFAULT_FRAME_COUNT: u32 = 512;
/// Capture cap: one minute of 48 kHz stereo, enough for any test scenario.
const CAPTURE_CAP_SAMPLES: usize = 48000 * 2 * 60;

/// Input signal synthesized by a null input stream.
#[derive(Debug, Clone, Copy)]
pub enum InputSignal {
    Silence,
    Sine { freq: f32, amplitude: f32 },
    /// Sawtooth counter, handy for sample-exact assertions.
    Ramp,
}

pub struct NullAudioHw {
    paced: bool,
    input_rate: u32,
    input_channels: u32,
    input_signal: InputSignal,
    mic_muted: Mutex<bool>,
    voice_volume: Mutex<f32>,
    parameters: Mutex<ParameterMap>,
    outputs: Mutex<Vec<Arc<NullStreamOut>>>,
    inputs: Mutex<Vec<Arc<NullStreamIn>>>,
}

impl NullAudioHw {
    /// Wall-clock paced device, the faithful stand-in for real hardware.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Unpaced device: writes and reads return immediately. Tests use this
    /// to run scenarios far faster than real time.
    pub fn instant() -> Self {
        Self::build(false)
    }

    fn build(paced: bool) -> Self {
        NullAudioHw {
            paced,
            input_rate: DEFAULT_RATE,
            input_channels: 2,
            input_signal: InputSignal::Silence,
            mic_muted: Mutex::new(false),
            voice_volume: Mutex::new(1.0),
            parameters: Mutex::new(ParameterMap::new()),
            outputs: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Fix the native input configuration; requests that differ are served
    /// at this configuration and the record engine adapts.
    pub fn with_input(mut self, rate: u32, channels: u32, signal: InputSignal) -> Self {
        self.input_rate = rate;
        self.input_channels = channels;
        self.input_signal = signal;
        self
    }

    /// Streams opened so far, in creation order; tests inspect captures
    /// through these.
    pub fn output(&self, index: usize) -> Option<Arc<NullStreamOut>> {
        self.outputs.lock().unwrap().get(index).cloned()
    }

    pub fn input(&self, index: usize) -> Option<Arc<NullStreamIn>> {
        self.inputs.lock().unwrap().get(index).cloned()
    }
}

impl Default for NullAudioHw {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHwDevice for NullAudioHw {
    fn init_check(&self) -> AudioResult<()> {
        Ok(())
    }

    fn set_mode(&self, _mode: AudioMode) -> AudioResult<()> {
        Ok(())
    }

    fn set_master_volume(&self, _volume: f32) -> AudioResult<()> {
        // no hardware master stage; the software mixer scales
        Err(AudioError::InvalidOperation)
    }

    fn set_voice_volume(&self, volume: f32) -> AudioResult<()> {
        *self.voice_volume.lock().unwrap() = volume;
        Ok(())
    }

    fn set_mic_mute(&self, muted: bool) -> AudioResult<()> {
        *self.mic_muted.lock().unwrap() = muted;
        Ok(())
    }

    fn mic_mute(&self) -> bool {
        *self.mic_muted.lock().unwrap()
    }

    fn set_parameters(&self, params: &ParameterMap) -> AudioResult<()> {
        let mut stored = self.parameters.lock().unwrap();
        for key in params.keys() {
            if let Some(v) = params.get(key) {
                stored.set(key, v);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        self.parameters.lock().unwrap().filtered(keys)
    }

    fn open_output_stream(&self, config: &EndpointConfig) -> AudioResult<Arc<dyn StreamOut>> {
        let stream = Arc::new(NullStreamOut::new(
            config.sample_rate.unwrap_or(DEFAULT_RATE),
            config.channel_count.unwrap_or(2).clamp(1, 2),
            config.format.unwrap_or(SampleFormat::Pcm16),
            DEFAULT_FRAME_COUNT,
            self.paced,
        ));
        self.outputs.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    fn open_input_stream(&self, _config: &EndpointConfig) -> AudioResult<Arc<dyn StreamIn>> {
        // the null device captures at its native configuration; the record
        // engine resamples and adapts channels as needed
        let stream = Arc::new(NullStreamIn::new(
            self.input_rate,
            self.input_channels,
            self.input_signal,
            self.paced,
        ));
        self.inputs.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    fn input_buffer_size(&self, sample_rate: u32, _format: SampleFormat, channels: u32) -> usize {
        // 20 ms worth of input
        (sample_rate as usize / 50) * channels as usize * 2
    }
}

struct OutPacing {
    next_write: Option<Instant>,
}

pub struct NullStreamOut {
    sample_rate: AtomicU32,
    channels: u32,
    format: SampleFormat,
    frame_count: AtomicU32,
    paced: bool,
    stalled: std::sync::atomic::AtomicBool,
    pacing: Mutex<OutPacing>,
    captured: Mutex<Vec<i16>>,
    standby_count: AtomicUsize,
    volume: Mutex<(f32, f32)>,
}

impl NullStreamOut {
    fn new(rate: u32, channels: u32, format: SampleFormat, frame_count: u32, paced: bool) -> Self {
        NullStreamOut {
            sample_rate: AtomicU32::new(rate),
            channels,
            format,
            frame_count: AtomicU32::new(frame_count),
            paced,
            stalled: std::sync::atomic::AtomicBool::new(false),
            pacing: Mutex::new(OutPacing { next_write: None }),
            captured: Mutex::new(Vec::new()),
            standby_count: AtomicUsize::new(0),
            volume: Mutex::new((1.0, 1.0)),
        }
    }

    /// Everything written so far (bounded by the capture cap).
    pub fn captured(&self) -> Vec<i16> {
        self.captured.lock().unwrap().clone()
    }

    pub fn captured_len(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    pub fn clear_captured(&self) {
        self.captured.lock().unwrap().clear();
    }

    pub fn standby_count(&self) -> usize {
        self.standby_count.load(Ordering::Relaxed)
    }

    pub fn last_volume(&self) -> (f32, f32) {
        *self.volume.lock().unwrap()
    }

    /// Simulate a wedged device: writes block until the stall is cleared.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }
}

impl StreamOut for NullStreamOut {
    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn format(&self) -> SampleFormat {
        self.format
    }

    fn buffer_size(&self) -> usize {
        self.frame_count.load(Ordering::Relaxed) as usize * self.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        let rate = self.sample_rate().max(1);
        2 * self.frame_count.load(Ordering::Relaxed) * 1000 / rate
    }

    fn write(&self, samples: &[i16]) -> AudioResult<usize> {
        while self.stalled.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        {
            let mut captured = self.captured.lock().unwrap();
            let room = CAPTURE_CAP_SAMPLES.saturating_sub(captured.len());
            captured.extend_from_slice(&samples[..samples.len().min(room)]);
        }
        if self.paced {
            let frames = samples.len() as u64 / self.channels as u64;
            let dur = Duration::from_nanos(frames * 1_000_000_000 / self.sample_rate() as u64);
            let sleep_for = {
                let mut pacing = self.pacing.lock().unwrap();
                let now = Instant::now();
                let next = pacing.next_write.unwrap_or(now);
                let start = next.saturating_duration_since(now);
                pacing.next_write = Some(next.max(now) + dur);
                start
            };
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
        }
        Ok(samples.len())
    }

    fn standby(&self) {
        self.standby_count.fetch_add(1, Ordering::Relaxed);
        self.pacing.lock().unwrap().next_write = None;
    }

    fn set_volume(&self, left: f32, right: f32) -> AudioResult<()> {
        *self.volume.lock().unwrap() = (left, right);
        Ok(())
    }

    fn set_parameters(&self, params: &ParameterMap) -> AudioResult<()> {
        if let Some(rate) = params.get_int(KEY_SAMPLING_RATE) {
            if rate <= 0 {
                return Err(AudioError::InvalidArgument("sampling_rate"));
            }
            self.sample_rate.store(rate as u32, Ordering::Relaxed);
        }
        if let Some(fc) = params.get_int(KEY_FRAME_COUNT) {
            if fc <= 0 {
                return Err(AudioError::InvalidArgument("frame_count"));
            }
            self.frame_count.store(fc as u32, Ordering::Relaxed);
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        let mut all = ParameterMap::new();
        all.set(KEY_SAMPLING_RATE, self.sample_rate());
        all.set(KEY_FRAME_COUNT, self.frame_count.load(Ordering::Relaxed));
        all.filtered(keys)
    }
}

struct InState {
    phase: f64,
    counter: i16,
    next_read: Option<Instant>,
}

pub struct NullStreamIn {
    sample_rate: u32,
    channels: u32,
    signal: InputSignal,
    frame_count: u32,
    paced: bool,
    state: Mutex<InState>,
    standby_count: AtomicUsize,
}

impl NullStreamIn {
    fn new(rate: u32, channels: u32, signal: InputSignal, paced: bool) -> Self {
        NullStreamIn {
            sample_rate: rate,
            channels,
            signal,
            frame_count: (rate / 50).max(32),
            paced,
            state: Mutex::new(InState {
                phase: 0.0,
                counter: 0,
                next_read: None,
            }),
            standby_count: AtomicUsize::new(0),
        }
    }

    pub fn standby_count(&self) -> usize {
        self.standby_count.load(Ordering::Relaxed)
    }
}

impl StreamIn for NullStreamIn {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> u32 {
        self.channels
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::Pcm16
    }

    fn buffer_size(&self) -> usize {
        self.frame_count as usize * self.frame_size()
    }

    fn read(&self, samples: &mut [i16]) -> AudioResult<usize> {
        let frames = samples.len() / self.channels as usize;
        {
            let mut state = self.state.lock().unwrap();
            for f in 0..frames {
                let value = match self.signal {
                    InputSignal::Silence => 0,
                    InputSignal::Sine { freq, amplitude } => {
                        let v = (state.phase.sin() * amplitude as f64 * i16::MAX as f64) as i16;
                        state.phase +=
                            2.0 * std::f64::consts::PI * freq as f64 / self.sample_rate as f64;
                        v
                    }
                    InputSignal::Ramp => {
                        state.counter = state.counter.wrapping_add(16);
                        state.counter
                    }
                };
                for ch in 0..self.channels as usize {
                    samples[f * self.channels as usize + ch] = value;
                }
            }
        }
        if self.paced {
            let dur =
                Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate as u64);
            let sleep_for = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let next = state.next_read.unwrap_or(now);
                let start = next.saturating_duration_since(now);
                state.next_read = Some(next.max(now) + dur);
                start
            };
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
        }
        Ok(samples.len())
    }

    fn standby(&self) {
        self.standby_count.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().next_read = None;
    }

    fn set_parameters(&self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        let mut all = ParameterMap::new();
        all.set(KEY_SAMPLING_RATE, self.sample_rate);
        all.filtered(keys)
    }
}
