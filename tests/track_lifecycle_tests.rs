// Track state machine and fill-up discipline, driven through the public
// server/handle surface against the instant null device.

mod common;

use std::time::Duration;

use common::*;
use mixserve::{SampleFormat, StreamType, TrackState};

#[cfg(test)]
mod state_machine {
    use super::*;

    #[test]
    fn start_pause_resume_stop() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 2048, 0, None, ep)
            .unwrap();

        assert_eq!(handle.state(), TrackState::Idle);
        handle.start().unwrap();
        assert_eq!(handle.state(), TrackState::Active);

        // keep the ring supplied so PAUSING is observed by the mix loop
        let cblk = handle.control_block();
        cblk.write_frames(&const_block(100, 2048));

        handle.pause();
        assert!(wait_until(Duration::from_secs(2), || {
            cblk.write_frames(&const_block(100, 256));
            handle.state() == TrackState::Paused
        }));

        handle.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            cblk.write_frames(&const_block(100, 256));
            handle.state() == TrackState::Active
        }));

        handle.stop();
        assert!(wait_until(Duration::from_secs(2), || matches!(
            handle.state(),
            TrackState::Stopped | TrackState::Stopping
        )));
        assert!(wait_until(Duration::from_secs(2), || handle.state()
            == TrackState::Stopped));
    }

    #[test]
    fn illegal_transitions_are_rejected_without_side_effects() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();

        // flush is only legal from stopped/paused states
        handle.start().unwrap();
        assert_eq!(handle.state(), TrackState::Active);
        assert!(handle.flush().is_err());
        assert_eq!(handle.state(), TrackState::Active);

        // pause from a non-running state does nothing
        handle.stop();
        let _ = wait_until(Duration::from_secs(2), || {
            handle.state() == TrackState::Stopped
        });
        handle.pause();
        assert_eq!(handle.state(), TrackState::Stopped);
    }

    #[test]
    fn flush_resets_cursors_and_refills_on_restart() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();
        let cblk = handle.control_block();

        handle.start().unwrap();
        cblk.write_frames(&const_block(42, 500));
        handle.pause();
        // pause with a part-filled ring never reaches PAUSED (the gate is
        // still FILLING); stop instead settles it out of the active list
        handle.stop();
        assert!(wait_until(Duration::from_secs(2), || handle.state()
            == TrackState::Stopped));

        handle.flush().unwrap();
        assert_eq!(handle.state(), TrackState::Flushed);
        assert_eq!(cblk.user(), 0);
        assert_eq!(cblk.server(), 0);
        assert_eq!(cblk.frames_ready(), 0);

        // restart goes back through fill-up
        handle.start().unwrap();
        assert_eq!(handle.state(), TrackState::Active);
    }
}

#[cfg(test)]
mod fill_up {
    use super::*;

    #[test]
    fn no_audio_until_a_full_buffer_or_force_ready() {
        let (hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let out = hw.output(0).unwrap();
        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 2048, 0, None, ep)
            .unwrap();
        let cblk = handle.control_block();

        handle.start().unwrap();
        // a part-filled ring must not be mixed
        cblk.write_frames(&const_block(1000, 1024));
        assert!(!wait_until(Duration::from_millis(300), || {
            out.captured_len() > 0
        }));

        // completing the buffer opens the gate
        cblk.write_frames(&const_block(1000, 1024));
        assert!(wait_until(Duration::from_secs(2), || out.captured_len() > 0));
    }

    #[test]
    fn force_ready_preempts_the_gate() {
        let (hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let out = hw.output(0).unwrap();
        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 4096, 0, None, ep)
            .unwrap();

        handle.start().unwrap();
        handle.control_block().write_frames(&const_block(1234, 128));
        assert!(!wait_until(Duration::from_millis(200), || {
            out.captured_len() > 0
        }));

        handle.force_ready();
        assert!(wait_until(Duration::from_secs(2), || out.captured_len() > 0));
        let captured = out.captured();
        assert!(captured.iter().any(|&s| s == 1234));
    }
}

#[cfg(test)]
mod retry_eviction {
    use super::*;

    #[test]
    fn a_dry_track_is_evicted_while_a_fed_one_survives() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();

        let starved = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();
        let fed = server
            .create_track(TEST_PID, StreamType::Ring, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();

        let fed_cblk = fed.control_block();
        let starved_cblk = starved.control_block();

        starved.start().unwrap();
        fed.start().unwrap();
        starved_cblk.write_frames(&const_block(500, 1024));

        // keep the second track supplied while the first runs dry
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop2 = stop.clone();
        let feeder = std::thread::spawn(move || {
            while !stop2.load(std::sync::atomic::Ordering::Relaxed) {
                fed_cblk.write_frames(&const_block(250, 256));
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        // the starved music track burns its retry budget and drops out
        assert!(wait_until(Duration::from_secs(5), || !server.is_music_active()));
        // the fed one is still being mixed
        assert_eq!(fed.state(), TrackState::Active);

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        feeder.join().unwrap();
    }
}
