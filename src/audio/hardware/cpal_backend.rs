// Real output devices through cpal. The HAL contract is a blocking `write`,
// cpal's is a pull callback; the bridge is an SPSC ring drained by the
// callback, with a condvar waking blocked writers as space frees up. The
// cpal stream itself is owned by a dedicated holder thread because it is
// not Send on every host API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{debug, error, warn};

use crate::audio::params::{ParameterMap, KEY_SAMPLING_RATE};
use crate::audio::types::{AudioError, AudioMode, AudioResult, EndpointConfig, SampleFormat};

use super::{AudioHwDevice, StreamIn, StreamOut};

/// Frames per HAL period reported to the engine.
const PERIOD_FRAMES: u32 = 1024;
/// Ring capacity in periods; the extra headroom absorbs callback jitter.
const RING_PERIODS: usize = 4;

pub struct CpalAudioHw {
    mic_muted: Mutex<bool>,
}

impl CpalAudioHw {
    pub fn new() -> Self {
        CpalAudioHw {
            mic_muted: Mutex::new(false),
        }
    }
}

impl Default for CpalAudioHw {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHwDevice for CpalAudioHw {
    fn init_check(&self) -> AudioResult<()> {
        if cpal::default_host().default_output_device().is_some() {
            Ok(())
        } else {
            Err(AudioError::NotInitialized)
        }
    }

    fn set_mode(&self, _mode: AudioMode) -> AudioResult<()> {
        Ok(())
    }

    fn set_master_volume(&self, _volume: f32) -> AudioResult<()> {
        Err(AudioError::InvalidOperation)
    }

    fn set_voice_volume(&self, _volume: f32) -> AudioResult<()> {
        Ok(())
    }

    fn set_mic_mute(&self, muted: bool) -> AudioResult<()> {
        *self.mic_muted.lock().unwrap() = muted;
        Ok(())
    }

    fn mic_mute(&self) -> bool {
        *self.mic_muted.lock().unwrap()
    }

    fn set_parameters(&self, _params: &ParameterMap) -> AudioResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &[&str]) -> ParameterMap {
        ParameterMap::new()
    }

    fn open_output_stream(&self, _config: &EndpointConfig) -> AudioResult<Arc<dyn StreamOut>> {
        let stream = CpalStreamOut::open()?;
        Ok(Arc::new(stream))
    }

    fn open_input_stream(&self, _config: &EndpointConfig) -> AudioResult<Arc<dyn StreamIn>> {
        // capture via cpal is not wired up; record endpoints run on the
        // null backend
        Err(AudioError::NotInitialized)
    }

    fn input_buffer_size(&self, sample_rate: u32, _format: SampleFormat, channels: u32) -> usize {
        (sample_rate as usize / 50) * channels as usize * 2
    }
}

pub struct CpalStreamOut {
    sample_rate: u32,
    channels: u32,
    producer: Mutex<HeapProd<i16>>,
    space: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    holder: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalStreamOut {
    fn open() -> AudioResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32), String>>();
        let space = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // negotiated capacity is settled before the holder thread starts:
        // stereo periods at the maximum channel count we report
        let ring = HeapRb::<i16>::new(PERIOD_FRAMES as usize * 2 * RING_PERIODS);
        let (producer, mut consumer) = ring.split();

        let space_cb = space.clone();
        let shutdown_holder = shutdown.clone();
        let holder = thread::Builder::new()
            .name("cpal-out".into())
            .spawn(move || {
                let build = || -> Result<(cpal::Stream, u32, u32), String> {
                    let host = cpal::default_host();
                    let device = host
                        .default_output_device()
                        .ok_or_else(|| "no output device".to_string())?;
                    let supported = device
                        .default_output_config()
                        .map_err(|e| format!("default config: {e}"))?;
                    let sample_rate = supported.sample_rate().0;
                    let channels = supported.channels() as u32;
                    let config: cpal::StreamConfig = supported.config();

                    let stream = match supported.sample_format() {
                        cpal::SampleFormat::F32 => device
                            .build_output_stream(
                                &config,
                                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                    for sample in data.iter_mut() {
                                        *sample = consumer
                                            .try_pop()
                                            .map(|s| s as f32 / i16::MAX as f32)
                                            .unwrap_or(0.0);
                                    }
                                    let (_lock, cvar) = &*space_cb;
                                    cvar.notify_one();
                                },
                                |err| error!("cpal stream error: {err}"),
                                None,
                            )
                            .map_err(|e| format!("build stream: {e}"))?,
                        cpal::SampleFormat::I16 => device
                            .build_output_stream(
                                &config,
                                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                                    let popped = consumer.pop_slice(data);
                                    data[popped..].fill(0);
                                    let (_lock, cvar) = &*space_cb;
                                    cvar.notify_one();
                                },
                                |err| error!("cpal stream error: {err}"),
                                None,
                            )
                            .map_err(|e| format!("build stream: {e}"))?,
                        other => return Err(format!("unsupported sample format {other:?}")),
                    };
                    stream.play().map_err(|e| format!("play: {e}"))?;
                    Ok((stream, sample_rate, channels))
                };

                match build() {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        debug!("cpal output running at {rate} Hz, {channels} ch");
                        while !shutdown_holder.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|_| AudioError::Hardware("spawn cpal holder"))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| AudioError::Hardware("cpal holder died"))?
            .map_err(|e| {
                warn!("cpal open failed: {e}");
                AudioError::NotInitialized
            })?;

        Ok(CpalStreamOut {
            sample_rate,
            channels: channels.clamp(1, 2),
            producer: Mutex::new(producer),
            space,
            shutdown,
            holder: Mutex::new(Some(holder)),
        })
    }
}

impl Drop for CpalStreamOut {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.holder.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl StreamOut for CpalStreamOut {
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
        PERIOD_FRAMES as usize * self.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        PERIOD_FRAMES * RING_PERIODS as u32 * 1000 / self.sample_rate.max(1)
    }

    fn write(&self, samples: &[i16]) -> AudioResult<usize> {
        let mut producer = self.producer.lock().unwrap();
        let mut written = 0usize;
        while written < samples.len() {
            written += producer.push_slice(&samples[written..]);
            if written < samples.len() {
                if producer.vacant_len() == 0 {
                    let (lock, cvar) = &*self.space;
                    let guard = lock.lock().unwrap();
                    // bounded wait; the callback may already have drained
                    let _ = cvar.wait_timeout(guard, Duration::from_millis(20)).unwrap();
                }
            }
        }
        Ok(written)
    }

    fn standby(&self) {
        // the callback zero-fills when the ring drains; nothing to do
    }

    fn set_volume(&self, _left: f32, _right: f32) -> AudioResult<()> {
        Err(AudioError::InvalidOperation)
    }

    fn set_parameters(&self, _params: &ParameterMap) -> AudioResult<()> {
        Err(AudioError::InvalidOperation)
    }

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        let mut all = ParameterMap::new();
        all.set(KEY_SAMPLING_RATE, self.sample_rate);
        all.filtered(keys)
    }
}
