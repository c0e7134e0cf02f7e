// Record endpoint thread: reads the input device at its native
// configuration and produces into the single active record track's ring,
// resampling and adapting channels on the way. Start and stop are
// synchronous; the caller blocks until this loop acknowledges.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use colored::Colorize;
use tracing::{debug, error, info, warn};

use crate::audio::client::Client;
use crate::audio::events::PendingEvent;
use crate::audio::mixer::provider::{AudioBuffer, AudioBufferProvider};
use crate::audio::mixer::LinearResampler;
use crate::audio::params::{ParameterMap, KEY_CHANNELS, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::audio::server::AudioServer;
use crate::audio::track::record::RecordTrackFeed;
use crate::audio::track::{RecordTrack, TrackState};
use crate::audio::types::{
    AudioError, AudioResult, EndpointId, OutputDescriptor, SampleFormat,
    RECORD_OVERFLOW_BACKOFF, RECORD_READ_ERROR_SLEEP,
};
use crate::audio::StreamIn;
use crate::audio_debug;

use super::{ThreadCore, ThreadState};

pub(crate) struct RecordState {
    pub sample_rate: u32,
    pub channel_count: u32,
    pub format: SampleFormat,
    pub frame_size: usize,
    /// device frames per read chunk
    pub frame_count: usize,
    pub req_sample_rate: u32,
    pub req_channel_count: u32,
    pub config_generation: u64,

    pub active_track: Option<Arc<RecordTrack>>,
    pub standby: bool,

    pub new_parameters: VecDeque<ParameterMap>,
    pub param_status: Option<AudioResult<()>>,
    pub config_events: VecDeque<PendingEvent>,
}

impl ThreadState for RecordState {
    fn new_parameters(&mut self) -> &mut VecDeque<ParameterMap> {
        &mut self.new_parameters
    }

    fn param_status(&mut self) -> &mut Option<AudioResult<()>> {
        &mut self.param_status
    }

    fn config_events(&mut self) -> &mut VecDeque<PendingEvent> {
        &mut self.config_events
    }
}

pub struct RecordThread {
    id: EndpointId,
    server: Weak<AudioServer>,
    input: Arc<dyn StreamIn>,
    core: ThreadCore<RecordState>,
    start_stop_cv: Condvar,
}

impl RecordThread {
    pub(crate) fn new(
        id: EndpointId,
        input: Arc<dyn StreamIn>,
        server: Weak<AudioServer>,
        req_sample_rate: u32,
        req_channel_count: u32,
    ) -> Arc<RecordThread> {
        let thread = RecordThread {
            id,
            server,
            input,
            core: ThreadCore::new(RecordState {
                sample_rate: 0,
                channel_count: 0,
                format: SampleFormat::Pcm16,
                frame_size: 1,
                frame_count: 0,
                req_sample_rate,
                req_channel_count: req_channel_count.clamp(1, 2),
                config_generation: 0,
                active_track: None,
                standby: true,
                new_parameters: VecDeque::new(),
                param_status: None,
                config_events: VecDeque::new(),
            }),
            start_stop_cv: Condvar::new(),
        };
        {
            let mut st = thread.lock_state();
            thread.read_input_parameters(&mut st);
            st.config_events.push_back(PendingEvent::InputOpened);
        }
        Arc::new(thread)
    }

    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        std::thread::Builder::new()
            .name(format!("record-{}", self.id))
            .spawn(move || me.run())
            .expect("failed to spawn record thread")
    }

    fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.core.lock()
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock_state().req_sample_rate
    }

    pub fn channel_count(&self) -> u32 {
        self.lock_state().req_channel_count
    }

    pub fn format(&self) -> SampleFormat {
        self.lock_state().format
    }

    pub fn descriptor(&self) -> OutputDescriptor {
        let st = self.lock_state();
        OutputDescriptor {
            sample_rate: st.sample_rate,
            channel_count: st.channel_count,
            format: st.format,
            frame_count: st.frame_count,
            latency_ms: 0,
        }
    }

    /// Create the record track for a client request. Called under the
    /// server lock; record rings are sized by the client's frame count.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_record_track(
        self: &Arc<Self>,
        client: Arc<Client>,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
    ) -> AudioResult<Arc<RecordTrack>> {
        {
            let st = self.lock_state();
            if st.sample_rate > 2 * sample_rate {
                return Err(AudioError::InvalidArgument(
                    "device rate more than 2x requested rate",
                ));
            }
        }
        RecordTrack::new(
            self,
            client,
            sample_rate,
            format,
            channel_count,
            frame_count,
            flags,
        )
    }

    /// Synchronous start: flags the track RESUMING, wakes the loop, and
    /// waits for the acknowledgement broadcast. Only one record track may
    /// be active at a time.
    pub(crate) fn start(&self, track: &Arc<RecordTrack>) -> AudioResult<()> {
        debug!("record thread {} start", self.id);
        let mut st = self.lock_state();
        if let Some(active) = &st.active_track {
            if !Arc::ptr_eq(active, track) {
                return Err(AudioError::Busy);
            }
            if active.state() == TrackState::Pausing {
                active.set_state(TrackState::Resuming);
            }
            return Ok(());
        }

        st.active_track = Some(track.clone());
        track.set_state(TrackState::Resuming);
        self.core.notify_work();
        loop {
            let still_starting = st
                .active_track
                .as_ref()
                .map(|t| Arc::ptr_eq(t, track) && t.state() == TrackState::Resuming)
                .unwrap_or(false);
            if !still_starting {
                break;
            }
            if self.core.exit_pending() {
                st.active_track = None;
                return Err(AudioError::InvalidOperation);
            }
            let (guard, _) = self
                .start_stop_cv
                .wait_timeout(st, Duration::from_millis(100))
                .unwrap_or_else(|p| p.into_inner());
            st = guard;
        }
        if st.active_track.is_some() {
            debug!("record started OK");
            Ok(())
        } else {
            debug!("record failed to start");
            Err(AudioError::InvalidArgument("channel count mismatch"))
        }
    }

    /// Synchronous stop, acknowledged by the loop clearing the active slot.
    pub(crate) fn stop(&self, track: &Arc<RecordTrack>) {
        debug!("record thread {} stop", self.id);
        let mut st = self.lock_state();
        let is_active = st
            .active_track
            .as_ref()
            .map(|t| Arc::ptr_eq(t, track))
            .unwrap_or(false);
        if !is_active {
            return;
        }
        track.set_state(TrackState::Pausing);
        self.core.notify_work();
        while st.active_track.is_some() {
            if self.core.exit_pending() {
                st.active_track = None;
                break;
            }
            let (guard, _) = self
                .start_stop_cv
                .wait_timeout(st, Duration::from_millis(100))
                .unwrap_or_else(|p| p.into_inner());
            st = guard;
        }
    }

    pub fn set_parameters(&self, params: ParameterMap) -> AudioResult<()> {
        self.core.set_parameters(params)
    }

    pub fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        self.input.get_parameters(keys)
    }

    pub(crate) fn send_config_event(&self, event: PendingEvent) {
        self.core.send_config_event(event);
    }

    fn process_config_events(&self) {
        while let Some((event, descriptor)) = self.core.pop_config_event(|st| OutputDescriptor {
            sample_rate: st.sample_rate,
            channel_count: st.channel_count,
            format: st.format,
            frame_count: st.frame_count,
            latency_ms: 0,
        }) {
            if let Some(server) = self.server.upgrade() {
                server.io_config_changed(self.id, event, descriptor);
            }
        }
    }

    pub(crate) fn exit(&self) {
        self.core.request_exit();
        self.start_stop_cv.notify_all();
    }

    // ------------------------------------------------------------------
    // the record loop
    // ------------------------------------------------------------------

    fn run(self: Arc<Self>) {
        info!("🎙️ {}: record thread {} running", "RECORD".green(), self.id);

        let mut rsmp_in: Vec<i16> = Vec::new();
        let mut rsmp_out: Vec<i16> = Vec::new();
        let mut rsmp_index = 0usize;
        let mut resampler: Option<LinearResampler> = None;
        let mut generation = 0u64;

        // loop-local mirrors of the input configuration
        let mut frame_count = 0usize;
        let mut device_channels = 1usize;
        let mut req_channels = 1usize;
        let mut resample = false;

        'main: while !self.core.exit_pending() {
            self.process_config_events();

            let track = {
                let mut st = self.lock_state();
                st = self.check_for_new_parameters(st);

                if generation != st.config_generation {
                    generation = st.config_generation;
                    frame_count = st.frame_count;
                    device_channels = st.channel_count.max(1) as usize;
                    req_channels = st.req_channel_count.max(1) as usize;
                    resample = st.sample_rate != st.req_sample_rate;
                    rsmp_in = vec![0i16; frame_count * device_channels];
                    rsmp_index = frame_count;
                    resampler = if resample {
                        Some(LinearResampler::new(
                            st.sample_rate,
                            st.req_sample_rate,
                            device_channels as u32,
                        ))
                    } else {
                        None
                    };
                }

                if st.active_track.is_none() && st.config_events.is_empty() {
                    if !st.standby {
                        self.input.standby();
                        st.standby = true;
                    }
                    if self.core.exit_pending() {
                        break 'main;
                    }
                    audio_debug!("record thread {} going to sleep", self.id);
                    let guard = self.core.wait_for_work(st);
                    drop(guard);
                    continue 'main;
                }

                if let Some(active) = st.active_track.clone() {
                    match active.state() {
                        TrackState::Pausing => {
                            st.active_track = None;
                            self.start_stop_cv.notify_all();
                        }
                        TrackState::Resuming => {
                            rsmp_index = frame_count;
                            if st.req_channel_count != active.channel_count() {
                                debug!("record start refused: channel count mismatch");
                                st.active_track = None;
                            } else {
                                active.set_state(TrackState::Active);
                            }
                            self.start_stop_cv.notify_all();
                        }
                        _ => {}
                    }
                    st.standby = false;
                }
                st.active_track.clone()
            };

            let Some(track) = track else { continue };

            let mut feed = RecordTrackFeed::new(track.clone());
            let mut buffer = AudioBuffer {
                raw: std::ptr::null_mut(),
                frame_count,
            };
            if feed.get_next_buffer(&mut buffer).is_ok() && !buffer.is_empty() {
                let obtained = buffer.frame_count;
                let consumed = if resample {
                    let rs = resampler.as_mut().expect("resampler when rates differ");
                    self.fill_resampled(
                        rs,
                        &mut rsmp_in,
                        &mut rsmp_out,
                        &mut rsmp_index,
                        frame_count,
                        device_channels,
                        req_channels,
                        &mut buffer,
                    )
                } else {
                    self.fill_direct(
                        &mut rsmp_in,
                        &mut rsmp_index,
                        frame_count,
                        device_channels,
                        req_channels,
                        &mut buffer,
                    )
                };
                buffer.frame_count = consumed.min(obtained);
                feed.release_buffer(&mut buffer);
                track.clear_overflow();
            } else {
                // client is not draining its ring fast enough
                if track.set_overflow() {
                    warn!("record thread {}: buffer overflow", self.id);
                }
                std::thread::sleep(RECORD_OVERFLOW_BACKOFF);
            }
        }

        {
            let mut st = self.lock_state();
            if !st.standby {
                self.input.standby();
                st.standby = true;
            }
            st.active_track = None;
        }
        self.start_stop_cv.notify_all();
        self.send_config_event(PendingEvent::InputClosed);
        self.process_config_events();
        info!("record thread {} exiting", self.id);
    }

    /// Device-rate path: chunked copy from the input buffer into the track
    /// ring with channel adaptation (average down, duplicate up). Returns
    /// frames actually produced into the ring.
    #[allow(clippy::too_many_arguments)]
    fn fill_direct(
        &self,
        rsmp_in: &mut Vec<i16>,
        rsmp_index: &mut usize,
        frame_count: usize,
        device_channels: usize,
        req_channels: usize,
        buffer: &mut AudioBuffer,
    ) -> usize {
        // SAFETY: writable track-ring region held until release_buffer.
        let dst = unsafe { buffer.as_mut_slice(req_channels) };
        let mut frames_out = dst.len() / req_channels;
        let mut out_pos = 0usize;

        while frames_out > 0 {
            let frames_in = frame_count - *rsmp_index;
            if frames_in > 0 {
                let n = frames_in.min(frames_out);
                let src = &rsmp_in[*rsmp_index * device_channels..];
                let out = &mut dst[out_pos * req_channels..];
                if device_channels == req_channels {
                    out[..n * req_channels].copy_from_slice(&src[..n * req_channels]);
                } else if device_channels == 1 {
                    for f in 0..n {
                        out[f * 2] = src[f];
                        out[f * 2 + 1] = src[f];
                    }
                } else {
                    for f in 0..n {
                        let l = src[f * 2] as i32;
                        let r = src[f * 2 + 1] as i32;
                        out[f] = ((l + r) >> 1) as i16;
                    }
                }
                *rsmp_index += n;
                out_pos += n;
                frames_out -= n;
            }
            if frames_out > 0 && *rsmp_index == frame_count {
                match self.input.read(&mut rsmp_in[..]) {
                    Ok(_) => *rsmp_index = 0,
                    Err(e) => {
                        error!("error reading audio input: {e}");
                        std::thread::sleep(RECORD_READ_ERROR_SLEEP);
                        *rsmp_index = frame_count;
                        break;
                    }
                }
            }
        }
        out_pos
    }

    /// Resampling path: the thread acts as the resampler's pull source so
    /// device reads happen exactly when input frames are needed. The
    /// resampler emits stereo; mono requests average back down.
    #[allow(clippy::too_many_arguments)]
    fn fill_resampled(
        &self,
        resampler: &mut LinearResampler,
        rsmp_in: &mut Vec<i16>,
        rsmp_out: &mut Vec<i16>,
        rsmp_index: &mut usize,
        frame_count: usize,
        device_channels: usize,
        req_channels: usize,
        buffer: &mut AudioBuffer,
    ) -> usize {
        // SAFETY: writable track-ring region held until release_buffer.
        let dst = unsafe { buffer.as_mut_slice(req_channels) };
        let frames_out = dst.len() / req_channels;
        rsmp_out.resize(frames_out * 2, 0);
        rsmp_out.fill(0);

        let produced = {
            let mut source = RecordSource {
                input: self.input.as_ref(),
                rsmp_in,
                rsmp_index,
                frame_count,
                channels: device_channels,
            };
            resampler.resample(&mut rsmp_out[..frames_out * 2], &mut source)
        };

        if req_channels == 1 {
            for f in 0..produced {
                let l = rsmp_out[f * 2] as i32;
                let r = rsmp_out[f * 2 + 1] as i32;
                dst[f] = ((l + r) >> 1) as i16;
            }
        } else {
            dst[..produced * 2].copy_from_slice(&rsmp_out[..produced * 2]);
        }
        produced
    }

    fn check_for_new_parameters<'a>(
        &'a self,
        mut st: MutexGuard<'a, RecordState>,
    ) -> MutexGuard<'a, RecordState> {
        while let Some(params) = st.new_parameters.pop_front() {
            let mut status: AudioResult<()> = Ok(());
            let mut reconfig = false;

            if let Some(rate) = params.get_int(KEY_SAMPLING_RATE) {
                if rate > 0 {
                    st.req_sample_rate = rate as u32;
                    reconfig = true;
                } else {
                    status = Err(AudioError::InvalidArgument("sampling_rate"));
                }
            }
            if let Some(format) = params.get_format() {
                match format {
                    Ok(SampleFormat::Pcm16) => reconfig = true,
                    Ok(_) => status = Err(AudioError::InvalidArgument("record format")),
                    Err(e) => status = Err(e),
                }
            }
            if let Some(channels) = params.get_int(KEY_CHANNELS) {
                if (1..=2).contains(&channels) {
                    st.req_channel_count = channels as u32;
                    reconfig = true;
                } else {
                    status = Err(AudioError::InvalidArgument("record channels"));
                }
            }
            if params.get_int(KEY_FRAME_COUNT).is_some() {
                if st.active_track.is_some() {
                    status = Err(AudioError::InvalidOperation);
                } else {
                    reconfig = true;
                }
            }

            if status.is_ok() {
                let mut applied = self.input.set_parameters(&params);
                if matches!(applied, Err(AudioError::InvalidOperation)) {
                    self.input.standby();
                    applied = self.input.set_parameters(&params);
                }
                // the engine can adapt rate and channel mismatches itself as
                // long as the device stays within the resampler's 2x window
                if applied.is_err()
                    && self.input.sample_rate() <= 2 * st.req_sample_rate
                    && self.input.channel_count() <= 2
                    && st.req_channel_count <= 2
                {
                    applied = Ok(());
                }
                status = applied;
                if status.is_ok() && reconfig {
                    self.read_input_parameters(&mut st);
                    st.config_events.push_back(PendingEvent::InputConfigChanged);
                }
            }

            st = self.core.answer_parameters(st, status);
        }
        st
    }

    fn read_input_parameters(&self, st: &mut RecordState) {
        st.sample_rate = self.input.sample_rate();
        st.channel_count = self.input.channel_count().clamp(1, 2);
        st.format = self.input.format();
        st.frame_size = self.input.frame_size().max(1);
        st.frame_count = (self.input.buffer_size() / st.frame_size).max(1);
        if st.req_sample_rate == 0 {
            st.req_sample_rate = st.sample_rate;
        }
        st.config_generation += 1;
    }
}

impl std::fmt::Debug for RecordThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordThread").field("id", &self.id).finish()
    }
}

/// Pull source over the input device for the resampler: refills the staging
/// buffer from the device exactly when it runs dry.
struct RecordSource<'a> {
    input: &'a dyn StreamIn,
    rsmp_in: &'a mut Vec<i16>,
    rsmp_index: &'a mut usize,
    frame_count: usize,
    channels: usize,
}

impl AudioBufferProvider for RecordSource<'_> {
    fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()> {
        if *self.rsmp_index >= self.frame_count {
            match self.input.read(&mut self.rsmp_in[..]) {
                Ok(_) => *self.rsmp_index = 0,
                Err(e) => {
                    error!("error reading audio input: {e}");
                    std::thread::sleep(RECORD_READ_ERROR_SLEEP);
                    *self.rsmp_index = self.frame_count;
                    buffer.clear();
                    return Err(AudioError::NotEnoughData);
                }
            }
        }
        let avail = self.frame_count - *self.rsmp_index;
        let frames = buffer.frame_count.min(avail);
        if frames == 0 {
            buffer.clear();
            return Err(AudioError::NotEnoughData);
        }
        buffer.raw = self.rsmp_in[*self.rsmp_index * self.channels..].as_mut_ptr();
        buffer.frame_count = frames;
        Ok(())
    }

    fn release_buffer(&mut self, buffer: &mut AudioBuffer) {
        *self.rsmp_index += buffer.frame_count;
        buffer.clear();
    }
}
