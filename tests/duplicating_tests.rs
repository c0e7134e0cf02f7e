// Duplicating endpoint: one mix fanned out to two destination mixers, with
// bounded tolerance for a stalled destination.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mixserve::{SampleFormat, StreamType};

#[test]
fn both_destinations_receive_the_mix() {
    let (hw, server) = instant_server();
    let a = server.open_output(&output_config(48000), 0).unwrap();
    let b = server.open_output(&output_config(44100), 0).unwrap();
    let dup = server.open_duplicate_output(a, b).unwrap();

    let out_a = hw.output(0).unwrap();
    let out_b = hw.output(1).unwrap();

    let handle = server
        .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, dup)
        .unwrap();
    handle.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let cblk = handle.control_block();
    let stop2 = stop.clone();
    let producer = std::thread::spawn(move || {
        let mut phase = 0.0f64;
        while !stop2.load(Ordering::Relaxed) {
            let block = sine_block(500.0, 48000, 0.4, 256, &mut phase);
            let _ = cblk.write_frames_blocking(&block);
        }
    });

    // both sinks see signal, each resampled to its own rate
    assert!(wait_until(Duration::from_secs(5), || {
        out_a.captured().iter().any(|&s| s.abs() > 4000)
            && out_b.captured().iter().any(|&s| s.abs() > 4000)
    }));

    stop.store(true, Ordering::Relaxed);
    producer.join().unwrap();
}

#[test]
fn a_stalled_destination_does_not_stall_the_other() {
    let (hw, server) = instant_server();
    let a = server.open_output(&output_config(48000), 0).unwrap();
    let b = server.open_output(&output_config(48000), 0).unwrap();
    let dup = server.open_duplicate_output(a, b).unwrap();

    let out_a = hw.output(0).unwrap();
    let out_b = hw.output(1).unwrap();

    let handle = server
        .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, dup)
        .unwrap();
    handle.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let cblk = handle.control_block();
    let stop2 = stop.clone();
    let producer = std::thread::spawn(move || {
        while !stop2.load(Ordering::Relaxed) {
            let _ = cblk.write_frames_blocking(&const_block(3000, 256));
        }
    });

    assert!(wait_until(Duration::from_secs(5), || {
        out_a.captured_len() > 4096 && out_b.captured_len() > 4096
    }));

    // wedge B's device; its bridge ring backs up and the duplicating loop
    // falls back to its overflow queue, dropping past the bound
    out_b.set_stalled(true);
    std::thread::sleep(Duration::from_millis(50));
    let b_frozen = out_b.captured_len();
    let a_before = out_a.captured_len();

    assert!(wait_until(Duration::from_secs(5), || {
        out_a.captured_len() > a_before + 16384
    }));
    // B made no progress past one in-flight write while wedged
    assert!(out_b.captured_len() <= b_frozen + 4096);

    // releasing the stall lets B flow again
    out_b.set_stalled(false);
    let b_after = out_b.captured_len();
    assert!(wait_until(Duration::from_secs(5), || {
        out_b.captured_len() > b_after
    }));

    stop.store(true, Ordering::Relaxed);
    producer.join().unwrap();
}

#[test]
fn closing_a_destination_detaches_it_from_the_duplicator() {
    let (hw, server) = instant_server();
    let a = server.open_output(&output_config(48000), 0).unwrap();
    let b = server.open_output(&output_config(48000), 0).unwrap();
    let dup = server.open_duplicate_output(a, b).unwrap();

    let out_a = hw.output(0).unwrap();

    let handle = server
        .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, dup)
        .unwrap();
    handle.start().unwrap();

    // closing B must not wedge the duplicating loop
    server.close_output(b).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let cblk = handle.control_block();
    let stop2 = stop.clone();
    let producer = std::thread::spawn(move || {
        while !stop2.load(Ordering::Relaxed) {
            let _ = cblk.write_frames_blocking(&const_block(2500, 256));
        }
    });

    assert!(wait_until(Duration::from_secs(5), || {
        out_a.captured().iter().any(|&s| s == 2500)
    }));

    stop.store(true, Ordering::Relaxed);
    producer.join().unwrap();
}
