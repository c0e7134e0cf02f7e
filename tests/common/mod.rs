// Shared fixtures for the engine tests: an instant (unpaced) null device
// plus polling helpers, since the endpoint threads run on their own cadence.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mixserve::audio::hardware::null::NullAudioHw;
use mixserve::{AudioServer, EndpointConfig};

pub const TEST_PID: u32 = 4242;

pub fn instant_server() -> (Arc<NullAudioHw>, Arc<AudioServer>) {
    let hw = Arc::new(NullAudioHw::instant());
    let server = AudioServer::new(hw.clone()).expect("server init");
    (hw, server)
}

pub fn output_config(rate: u32) -> EndpointConfig {
    EndpointConfig {
        devices: 1,
        sample_rate: Some(rate),
        channel_count: Some(2),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Interleaved stereo sine block.
pub fn sine_block(freq: f32, rate: u32, amplitude: f32, frames: usize, phase: &mut f64) -> Vec<i16> {
    let mut out = Vec::with_capacity(frames * 2);
    let step = 2.0 * std::f64::consts::PI * freq as f64 / rate as f64;
    for _ in 0..frames {
        let v = (phase.sin() * amplitude as f64 * i16::MAX as f64) as i16;
        out.push(v);
        out.push(v);
        *phase += step;
    }
    out
}

/// Interleaved stereo constant block.
pub fn const_block(value: i16, frames: usize) -> Vec<i16> {
    vec![value; frames * 2]
}
