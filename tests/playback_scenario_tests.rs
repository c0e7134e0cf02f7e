// End-to-end playback scenarios against the null device: rate-converted
// sine playback, two-track summing, and pause silence.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mixserve::{SampleFormat, StreamType};

/// Spawn a producer that keeps a track's ring topped up with a sine.
fn spawn_sine_producer(
    cblk: Arc<mixserve::ControlBlock>,
    freq: f32,
    rate: u32,
    amplitude: f32,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut phase = 0.0f64;
        while !stop.load(Ordering::Relaxed) {
            let block = sine_block(freq, rate, amplitude, 256, &mut phase);
            let _ = cblk.write_frames_blocking(&block);
        }
    })
}

#[test]
fn resampled_sine_reaches_the_device_without_gaps() {
    let (hw, server) = instant_server();
    let ep = server.open_output(&output_config(48000), 0).unwrap();
    let out = hw.output(0).unwrap();

    let handle = server
        .create_track(TEST_PID, StreamType::Music, 44100, SampleFormat::Pcm16, 2, 4410, 0, None, ep)
        .unwrap();
    handle.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_sine_producer(
        handle.control_block(),
        1000.0,
        44100,
        0.5,
        stop.clone(),
    );

    // let a healthy stretch of audio through (quarter second at 48 kHz)
    assert!(wait_until(Duration::from_secs(5), || {
        out.captured_len() >= 48000 / 4 * 2
    }));
    stop.store(true, Ordering::Relaxed);
    producer.join().unwrap();
    handle.stop();

    let captured = out.captured();
    // skip the fill-up head, measure the steady middle
    let mid = &captured[8192..captured.len() - 4096];
    let peak = mid.iter().map(|s| (*s as i32).abs()).max().unwrap_or(0);
    let expected = (0.5 * i16::MAX as f32) as i32;
    assert!(
        (peak - expected).abs() < expected / 5,
        "peak {} far from expected {}",
        peak,
        expected
    );

    let rms = (mid.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / mid.len() as f64).sqrt();
    let expected_rms = 0.5 * i16::MAX as f64 / std::f64::consts::SQRT_2;
    assert!(
        (rms - expected_rms).abs() < expected_rms * 0.25,
        "rms {} far from expected {} (gaps or distortion)",
        rms,
        expected_rms
    );
}

#[test]
fn two_tracks_mix_to_their_sum_without_distortion() {
    let (hw, server) = instant_server();
    let ep = server.open_output(&output_config(48000), 0).unwrap();
    let out = hw.output(0).unwrap();

    let music = server
        .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
        .unwrap();
    let ring = server
        .create_track(TEST_PID, StreamType::Ring, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
        .unwrap();

    let music_cblk = music.control_block();
    let ring_cblk = ring.control_block();
    music.start().unwrap();
    ring.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let feeders: Vec<_> = [(music_cblk, 8000i16), (ring_cblk, 6000i16)]
        .into_iter()
        .map(|(cblk, value)| {
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = cblk.write_frames_blocking(&const_block(value, 256));
                }
            })
        })
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        out.captured().iter().any(|&s| s == 14000)
    }));
    stop.store(true, Ordering::Relaxed);
    for f in feeders {
        f.join().unwrap();
    }

    let captured = out.captured();
    // at unity gain samples are bit-exact: one source, the other, their
    // sum, or silence; never an overdriven artifact
    assert!(captured
        .iter()
        .all(|&s| matches!(s, 0 | 6000 | 8000 | 14000)));
}

#[test]
fn pause_silences_the_stream_until_resume() {
    let (hw, server) = instant_server();
    let ep = server.open_output(&output_config(48000), 0).unwrap();
    let out = hw.output(0).unwrap();

    let handle = server
        .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
        .unwrap();
    handle.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_sine_producer(handle.control_block(), 440.0, 48000, 0.4, stop.clone());

    assert!(wait_until(Duration::from_secs(5), || out.captured_len() > 8192));

    handle.pause();
    // once the pause lands the device stops receiving frames
    assert!(wait_until(Duration::from_secs(2), || {
        let len = out.captured_len();
        std::thread::sleep(Duration::from_millis(100));
        out.captured_len() == len
    }));
    let paused_len = out.captured_len();

    handle.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        out.captured_len() > paused_len + 4096
    }));

    stop.store(true, Ordering::Relaxed);
    producer.join().unwrap();
}
