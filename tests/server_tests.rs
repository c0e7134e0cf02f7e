// Server surface: endpoint registry, stream re-routing, config-change
// fan-out, parameter plumbing and error returns.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use mixserve::audio::params::{ParameterMap, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use mixserve::{AudioError, AudioHwDevice, IoConfigEvent, SampleFormat, StreamType};

#[cfg(test)]
mod errors {
    use super::*;

    #[test]
    fn unknown_endpoints_are_bad_indices() {
        let (_hw, server) = instant_server();
        let err = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, 99)
            .unwrap_err();
        assert_eq!(err, AudioError::BadIndex(99));
        assert_eq!(server.close_output(7), Err(AudioError::BadIndex(7)));
        assert_eq!(server.suspend_output(7), Err(AudioError::BadIndex(7)));
    }

    #[test]
    fn bridge_stream_type_is_not_a_client_type() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let err = server
            .create_track(TEST_PID, StreamType::Bridge, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));
    }

    #[test]
    fn mixer_endpoints_reject_rates_beyond_twice_the_device() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(44100), 0).unwrap();
        let err = server
            .create_track(TEST_PID, StreamType::Music, 96000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));
    }

    #[test]
    fn the_client_arena_is_bounded() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        // one giant ring blows the 1 MiB arena
        let err = server
            .create_track(
                TEST_PID,
                StreamType::Music,
                48000,
                SampleFormat::Pcm16,
                2,
                400_000,
                0,
                None,
                ep,
            )
            .unwrap_err();
        assert_eq!(err, AudioError::NoMemory);

        // a sane allocation still fits afterwards (no budget leak)
        let ok = server.create_track(
            TEST_PID,
            StreamType::Music,
            48000,
            SampleFormat::Pcm16,
            2,
            4096,
            0,
            None,
            ep,
        );
        assert!(ok.is_ok());
    }
}

#[cfg(test)]
mod parameters {
    use super::*;

    #[test]
    fn frame_count_changes_are_refused_while_tracks_exist() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let _handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();

        let mut params = ParameterMap::new();
        params.set(KEY_FRAME_COUNT, 256);
        assert_eq!(
            server.set_parameters(ep, params),
            Err(AudioError::InvalidOperation)
        );
    }

    #[test]
    fn sampling_rate_reconfigures_and_notifies() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(44100), 0).unwrap();
        let events = server.register_client();

        let mut params = ParameterMap::new();
        params.set(KEY_SAMPLING_RATE, 48000);
        server.set_parameters(ep, params).unwrap();

        assert_eq!(server.output_descriptor(ep).unwrap().sample_rate, 48000);

        let mut saw_config_change = false;
        while let Ok(n) = events.recv_timeout(Duration::from_secs(2)) {
            if let IoConfigEvent::OutputConfigChanged(desc) = n.event {
                assert_eq!(n.endpoint, ep);
                assert_eq!(desc.sample_rate, 48000);
                saw_config_change = true;
                break;
            }
        }
        assert!(saw_config_change);
    }

    #[test]
    fn global_parameters_land_on_the_hardware() {
        let (hw, server) = instant_server();
        let mut params = ParameterMap::new();
        params.set("routing", 2);
        server.set_parameters(0, params).unwrap();
        let back = hw.get_parameters(&["routing"]);
        assert_eq!(back.get("routing"), Some("2"));
    }
}

#[cfg(test)]
mod volumes {
    use super::*;

    #[test]
    fn master_and_stream_volume_round_trip() {
        let (_hw, server) = instant_server();
        let _ep = server.open_output(&output_config(48000), 0).unwrap();

        server.set_master_volume(0.5).unwrap();
        assert!((server.master_volume() - 0.5).abs() < 1e-6);
        server.set_master_mute(true);
        assert!(server.master_mute());
        server.set_master_mute(false);

        server
            .set_stream_volume(StreamType::Music, 0.25, 0)
            .unwrap();
        let v = server.stream_volume(StreamType::Music, 0).unwrap();
        assert!((v - 0.25).abs() < 1e-6);

        // voice-call volume is floored at the hardware and the getter
        // removes the offset again
        server
            .set_stream_volume(StreamType::VoiceCall, 0.4, 0)
            .unwrap();
        let v = server.stream_volume(StreamType::VoiceCall, 0).unwrap();
        assert!((v - 0.4).abs() < 1e-3);

        assert!(server
            .set_stream_mute(StreamType::EnforcedAudible, true)
            .is_err());
    }
}

#[cfg(test)]
mod routing {
    use super::*;

    #[test]
    fn set_stream_output_migrates_live_tracks() {
        let (hw, server) = instant_server();
        let ep1 = server.open_output(&output_config(48000), 0).unwrap();
        let ep2 = server.open_output(&output_config(48000), 0).unwrap();
        let out2 = hw.output(1).unwrap();
        let events = server.register_client();

        let handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep1)
            .unwrap();
        handle.start().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let cblk = handle.control_block();
        let stop2 = stop.clone();
        let producer = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                let _ = cblk.write_frames_blocking(&const_block(1111, 256));
            }
        });

        assert!(wait_until(Duration::from_secs(5), || server.is_music_active()));

        server.set_stream_output(StreamType::Music, ep2).unwrap();

        // the migrated track now feeds endpoint 2
        assert!(wait_until(Duration::from_secs(5), || {
            out2.captured().iter().any(|&s| s == 1111)
        }));

        let mut saw_stream_change = false;
        while let Ok(n) = events.recv_timeout(Duration::from_secs(2)) {
            if n.event == IoConfigEvent::StreamConfigChanged(StreamType::Music) {
                assert_eq!(n.endpoint, ep2);
                saw_stream_change = true;
                break;
            }
        }
        assert!(saw_stream_change);

        stop.store(true, Ordering::Relaxed);
        producer.join().unwrap();
    }
}

#[cfg(test)]
mod lifecycle_events {
    use super::*;

    #[test]
    fn open_and_close_are_announced() {
        let (_hw, server) = instant_server();
        let events = server.register_client();

        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let mut opened = false;
        while let Ok(n) = events.recv_timeout(Duration::from_secs(2)) {
            if matches!(n.event, IoConfigEvent::OutputOpened(_)) && n.endpoint == ep {
                opened = true;
                break;
            }
        }
        assert!(opened);

        server.close_output(ep).unwrap();
        let mut closed = false;
        while let Ok(n) = events.recv_timeout(Duration::from_secs(2)) {
            if n.event == IoConfigEvent::OutputClosed && n.endpoint == ep {
                closed = true;
                break;
            }
        }
        assert!(closed);
    }

    #[test]
    fn late_observers_learn_the_existing_topology() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();

        let events = server.register_client();
        let mut announced = false;
        while let Ok(n) = events.recv_timeout(Duration::from_secs(2)) {
            if matches!(n.event, IoConfigEvent::OutputOpened(_)) && n.endpoint == ep {
                announced = true;
                break;
            }
        }
        assert!(announced);
    }

    #[test]
    fn dump_reports_clients_and_endpoints() {
        let (_hw, server) = instant_server();
        let ep = server.open_output(&output_config(48000), 0).unwrap();
        let _handle = server
            .create_track(TEST_PID, StreamType::Music, 48000, SampleFormat::Pcm16, 2, 1024, 0, None, ep)
            .unwrap();
        let dump = server.dump();
        assert!(dump.contains("Clients:"));
        assert!(dump.contains(&format!("pid: {}", TEST_PID)));
        assert!(dump.contains("Output"));
    }
}
