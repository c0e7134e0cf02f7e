// Static one-shot clips: client-supplied shared buffers that play without
// per-frame production, including sub-clip looping.

mod common;

use std::time::Duration;

use common::*;
use mixserve::{SampleFormat, StreamType};

#[test]
fn a_short_clip_plays_to_completion() {
    let (hw, server) = instant_server();
    let ep = server.open_output(&output_config(48000), 0).unwrap();
    let out = hw.output(0).unwrap();

    let clip = vec![3333i16; 2000 * 2];
    let handle = server
        .create_track(
            TEST_PID,
            StreamType::Notification,
            48000,
            SampleFormat::Pcm16,
            2,
            0,
            0,
            Some(clip),
            ep,
        )
        .unwrap();
    assert_eq!(handle.frame_count(), 2000);

    handle.start().unwrap();

    // the whole clip must reach the device despite the producer never
    // writing another frame
    assert!(wait_until(Duration::from_secs(5), || {
        out.captured().iter().filter(|&&s| s == 3333).count() >= 2000 * 2
    }));
    let played = out.captured().iter().filter(|&&s| s == 3333).count();
    assert_eq!(played, 2000 * 2, "clip played a partial or doubled pass");
}

#[test]
fn loop_end_replays_the_clip_head() {
    let (hw, server) = instant_server();
    let ep = server.open_output(&output_config(48000), 0).unwrap();
    let out = hw.output(0).unwrap();

    let clip = vec![777i16; 1000 * 2];
    let handle = server
        .create_track(
            TEST_PID,
            StreamType::Notification,
            48000,
            SampleFormat::Pcm16,
            2,
            0,
            0,
            Some(clip),
            ep,
        )
        .unwrap();
    handle.set_loop_end(250);
    handle.start().unwrap();

    // far more than one pass worth of samples arrives while looping
    assert!(wait_until(Duration::from_secs(5), || {
        out.captured().iter().filter(|&&s| s == 777).count() > 1000 * 2 * 3
    }));

    handle.stop();
}
