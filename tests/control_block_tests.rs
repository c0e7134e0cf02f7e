// Shared control block protocol: cursor invariants, flush semantics,
// loop-point clamping and the client-side helpers.

use mixserve::audio::control_block::ControlBlock;
use mixserve::SampleFormat;

fn out_block(frames: u32) -> ControlBlock {
    ControlBlock::new_out(frames, 44100, 2, SampleFormat::Pcm16)
}

#[cfg(test)]
mod cursor_invariants {
    use super::*;

    #[test]
    fn cursors_stay_within_one_buffer_of_their_bases() {
        let cblk = out_block(64);
        let frames: Vec<i16> = vec![1; 64 * 2];
        // push the ring through many wraps with odd-sized chunks
        for _ in 0..1000 {
            let wrote = cblk.write_frames(&frames[..26]);
            assert!(wrote <= 13);
            let ready = cblk.frames_ready();
            assert!(ready <= 64);
            if ready > 0 {
                assert!(cblk.try_step_server(ready.min(7)));
            }
            let user_off = cblk.user().wrapping_sub(cblk.user_base());
            let server_off = cblk.server().wrapping_sub(cblk.server_base());
            assert!(user_off <= 64, "user ran past its base window: {user_off}");
            assert!(server_off <= 64, "server ran past its base window: {server_off}");
        }
    }

    #[test]
    fn consumed_never_exceeds_produced() {
        let cblk = out_block(32);
        let chunk: Vec<i16> = vec![7; 10 * 2];
        let mut produced: u64 = 0;
        let mut consumed: u64 = 0;
        for step in 0..500 {
            produced += cblk.write_frames(&chunk) as u64;
            let take = (step % 5) as u32 + 1;
            let take = take.min(cblk.frames_ready());
            if take > 0 && cblk.try_step_server(take) {
                consumed += take as u64;
            }
            assert!(consumed <= produced);
            assert_eq!(cblk.frames_ready() as u64, produced - consumed);
        }
    }

    #[test]
    fn producer_blocks_at_capacity() {
        let cblk = out_block(16);
        let data: Vec<i16> = vec![3; 32 * 2];
        assert_eq!(cblk.write_frames(&data), 16);
        // full: nothing more fits until the consumer advances
        assert_eq!(cblk.write_frames(&data), 0);
        assert_eq!(cblk.frames_available(), 0);
        assert!(cblk.try_step_server(4));
        assert_eq!(cblk.frames_available(), 4);
        assert_eq!(cblk.write_frames(&data[..4 * 2]), 4);
    }
}

#[cfg(test)]
mod flush_and_flow_control {
    use super::*;

    #[test]
    fn reset_returns_cursors_to_their_bases() {
        let cblk = out_block(32);
        let data: Vec<i16> = vec![5; 20 * 2];
        cblk.write_frames(&data);
        assert!(cblk.try_step_server(6));
        cblk.reset();
        assert_eq!(cblk.user(), 0);
        assert_eq!(cblk.server(), 0);
        assert_eq!(cblk.user_base(), 0);
        assert_eq!(cblk.server_base(), 0);
        assert_eq!(cblk.frames_ready(), 0);
    }

    #[test]
    fn flow_control_starts_raised_and_clears_on_first_write() {
        let cblk = out_block(32);
        assert!(cblk.flow_control_flag());
        cblk.write_frames(&[0i16; 2]);
        assert!(!cblk.flow_control_flag());
        cblk.reset();
        assert!(cblk.flow_control_flag());
    }

    #[test]
    fn force_ready_is_consumed_once()  {
        let cblk = out_block(32);
        assert!(!cblk.take_force_ready());
        cblk.set_force_ready();
        assert!(cblk.take_force_ready());
        assert!(!cblk.take_force_ready());
    }
}

#[cfg(test)]
mod loop_mode {
    use super::*;

    #[test]
    fn static_block_counts_as_fully_produced() {
        let clip: Vec<i16> = (0..100 * 2).map(|i| i as i16).collect();
        let cblk = ControlBlock::new_static(clip, 44100, 2, SampleFormat::Pcm16);
        assert_eq!(cblk.frame_count(), 100);
        assert_eq!(cblk.frames_ready(), 100);
        assert!(!cblk.flow_control_flag());
    }

    #[test]
    fn loop_end_limits_the_contiguous_fetch() {
        let clip: Vec<i16> = vec![9; 100 * 2];
        let cblk = ControlBlock::new_static(clip, 44100, 2, SampleFormat::Pcm16);
        cblk.set_loop_end(40);
        assert_eq!(cblk.server_fetch_limit(), 40);
        assert!(cblk.try_step_server(40));
        // wrapped back to the start of the pass, still looping
        assert_eq!(cblk.server_fetch_limit(), 40);
        assert!(cblk.frames_ready() > 0);
        cblk.clear_loop();
        assert_eq!(cblk.server_fetch_limit(), 100);
    }
}

#[cfg(test)]
mod record_side {
    use super::*;

    #[test]
    fn record_layout_reverses_the_roles() {
        let cblk = ControlBlock::new_in(32, 16000, 1, SampleFormat::Pcm16);
        assert!(!cblk.is_out());
        // server produces
        assert_eq!(cblk.frames_available(), 32);
        assert!(cblk.try_step_server(10));
        assert_eq!(cblk.frames_ready(), 10);
        // client drains at the user cursor
        let mut out = vec![0i16; 10];
        assert_eq!(cblk.read_frames(&mut out), 10);
        assert_eq!(cblk.frames_ready(), 0);
        assert_eq!(cblk.frames_available(), 32);
    }

    #[test]
    fn blocking_read_times_out_on_an_empty_ring() {
        let cblk = ControlBlock::new_in(16, 16000, 1, SampleFormat::Pcm16);
        let mut out = vec![0i16; 4];
        let start = std::time::Instant::now();
        let res = cblk.read_frames_blocking(&mut out);
        assert!(res.is_err());
        assert!(start.elapsed() >= std::time::Duration::from_millis(900));
    }
}
