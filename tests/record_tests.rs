// Record path: device-rate capture distributed to a client ring with
// resampling and channel adaptation.

mod common;

use std::time::Duration;

use common::*;
use mixserve::audio::hardware::null::{InputSignal, NullAudioHw};
use mixserve::{AudioServer, EndpointConfig, SampleFormat, TrackState};
use std::sync::Arc;

fn input_config(rate: u32, channels: u32) -> EndpointConfig {
    EndpointConfig {
        devices: 1,
        sample_rate: Some(rate),
        channel_count: Some(channels),
        ..Default::default()
    }
}

#[test]
fn mono_16k_device_serves_a_stereo_44k_client() {
    let hw = Arc::new(
        NullAudioHw::instant().with_input(
            16000,
            1,
            InputSignal::Sine {
                freq: 440.0,
                amplitude: 0.5,
            },
        ),
    );
    let server = AudioServer::new(hw.clone()).unwrap();
    let ep = server.open_input(&input_config(44100, 2)).unwrap();

    let handle = server
        .open_record(TEST_PID, ep, 44100, SampleFormat::Pcm16, 2, 8820, 0)
        .unwrap();
    handle.start().unwrap();
    assert_eq!(handle.state(), TrackState::Active);

    // pull half a second of client-rate audio
    let mut collected: Vec<i16> = Vec::new();
    let mut chunk = vec![0i16; 1024 * 2];
    while collected.len() < 44100 {
        let frames = handle.read_blocking(&mut chunk).expect("record data");
        collected.extend_from_slice(&chunk[..frames * 2]);
    }
    handle.stop();

    // the mono source is duplicated: channels must match sample for sample
    for frame in collected.chunks(2) {
        assert_eq!(frame[0], frame[1]);
    }

    // amplitude survives the 16k -> 44.1k interpolation
    let peak = collected.iter().map(|s| (*s as i32).abs()).max().unwrap();
    let expected = (0.5 * i16::MAX as f32) as i32;
    assert!(
        (peak - expected).abs() < expected / 5,
        "peak {} vs expected {}",
        peak,
        expected
    );
}

#[test]
fn second_record_client_is_refused_while_one_is_active() {
    let hw = Arc::new(NullAudioHw::instant().with_input(16000, 1, InputSignal::Silence));
    let server = AudioServer::new(hw.clone()).unwrap();
    let ep = server.open_input(&input_config(16000, 1)).unwrap();

    let first = server
        .open_record(TEST_PID, ep, 16000, SampleFormat::Pcm16, 1, 1600, 0)
        .unwrap();
    let second = server
        .open_record(TEST_PID, ep, 16000, SampleFormat::Pcm16, 1, 1600, 0)
        .unwrap();

    first.start().unwrap();
    assert!(second.start().is_err());
    first.stop();
}

#[test]
fn a_lazy_client_sees_the_overrun_flag() {
    let hw = Arc::new(NullAudioHw::instant().with_input(16000, 1, InputSignal::Ramp));
    let server = AudioServer::new(hw.clone()).unwrap();
    let ep = server.open_input(&input_config(16000, 1)).unwrap();

    let handle = server
        .open_record(TEST_PID, ep, 16000, SampleFormat::Pcm16, 1, 800, 0)
        .unwrap();
    handle.start().unwrap();

    // never read: the ring fills and the thread flags the overrun
    assert!(wait_until(Duration::from_secs(3), || handle.has_overflowed()));
    handle.stop();
}

#[test]
fn stereo_device_averages_down_to_a_mono_client() {
    let hw = Arc::new(
        NullAudioHw::instant().with_input(
            16000,
            2,
            InputSignal::Sine {
                freq: 100.0,
                amplitude: 0.25,
            },
        ),
    );
    let server = AudioServer::new(hw.clone()).unwrap();
    let ep = server.open_input(&input_config(16000, 1)).unwrap();

    let handle = server
        .open_record(TEST_PID, ep, 16000, SampleFormat::Pcm16, 1, 3200, 0)
        .unwrap();
    handle.start().unwrap();

    let mut chunk = vec![0i16; 1600];
    let mut collected = 0usize;
    while collected < 8000 {
        collected += handle.read_blocking(&mut chunk).expect("record data");
    }
    handle.stop();

    // both device channels carry the same sine, so the average keeps the
    // amplitude
    let peak = chunk.iter().map(|s| (*s as i32).abs()).max().unwrap();
    let expected = (0.25 * i16::MAX as f32) as i32;
    assert!((peak - expected).abs() < expected / 3);
}
