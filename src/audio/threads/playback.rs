// Playback endpoint threads. Three flavors share one loop skeleton:
//
// - Mixer: software-mixes every ready track and blocking-writes one stereo
//   block per cycle to the device.
// - Direct: single-track pass-through for formats the mixer cannot handle;
//   volume goes to the hardware.
// - Duplicating: a mixer whose output is written into OutputTracks feeding
//   downstream mixer endpoints instead of a device.
//
// Lock discipline: the thread lock is below the server lock and above the
// control-block mutexes. Device writes and config-event dispatch always run
// with the thread lock released; the duplicating flavor additionally
// releases its lock before stopping an OutputTrack (the stop takes the
// destination thread's lock).

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::Colorize;
use tracing::{debug, error, info, warn};

use crate::audio::client::Client;
use crate::audio::events::PendingEvent;
use crate::audio::mixer::provider::{pull, AudioBuffer, AudioBufferProvider};
use crate::audio::mixer::{allocate_name, free_name, SampleMixer};
use crate::audio::params::{ParameterMap, KEY_CHANNELS, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::audio::server::AudioServer;
use crate::audio::track::playback::TrackFeed;
use crate::audio::track::{FillStatus, OutputTrack, Track, TrackState};
use crate::audio::types::{
    AudioError, AudioResult, EndpointId, OutputDescriptor, PlaybackMetrics, SampleFormat,
    StreamType, StreamVolume, BUFFER_RECOVERY, DUMP_LOCK_RETRIES, DUMP_LOCK_SLEEP,
    MAX_BUFFER_RECOVERY, MAX_GAIN, MAX_TRACK_RETRIES, MAX_TRACK_STARTUP_RETRIES, STANDBY_TIMEOUT,
};
use crate::audio::StreamOut;
use crate::audio_debug;

use super::{silent_mode_requested, ThreadCore, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    Mixer,
    Direct,
    Duplicating,
}

pub(crate) struct PlaybackState {
    // negotiated output parameters, re-read on reconfiguration
    pub sample_rate: u32,
    pub channel_count: u32,
    pub format: SampleFormat,
    pub frame_size: usize,
    pub frame_count: usize,
    pub min_bytes_to_write: u64,
    pub config_generation: u64,

    pub tracks: Vec<Arc<Track>>,
    pub active_tracks: Vec<Weak<Track>>,
    pub name_mask: u32,
    pub pending_name_releases: Vec<usize>,

    pub master_volume: f32,
    pub master_mute: bool,
    pub stream_types: [StreamVolume; StreamType::COUNT],

    pub standby: bool,
    pub suspended: bool,
    pub bytes_written: u64,
    pub num_writes: u64,
    pub num_delayed_writes: u64,
    pub in_write: bool,

    pub new_parameters: VecDeque<ParameterMap>,
    pub param_status: Option<AudioResult<()>>,
    pub config_events: VecDeque<PendingEvent>,

    // duplicating fan-out
    pub output_tracks: Vec<Arc<OutputTrack>>,
}

impl ThreadState for PlaybackState {
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

pub struct PlaybackThread {
    id: EndpointId,
    kind: PlaybackKind,
    server: Weak<AudioServer>,
    stream: Arc<dyn StreamOut>,
    core: ThreadCore<PlaybackState>,
}

enum Cycle {
    Mix,
    Direct(Arc<Track>),
    Sleep,
}

impl PlaybackThread {
    pub(crate) fn new(
        id: EndpointId,
        kind: PlaybackKind,
        stream: Arc<dyn StreamOut>,
        server: Weak<AudioServer>,
        master_volume: f32,
        master_mute: bool,
        stream_types: [StreamVolume; StreamType::COUNT],
    ) -> Arc<PlaybackThread> {
        let thread = PlaybackThread {
            id,
            kind,
            server,
            stream,
            core: ThreadCore::new(PlaybackState {
                sample_rate: 0,
                channel_count: 0,
                format: SampleFormat::Pcm16,
                frame_size: 1,
                frame_count: 0,
                min_bytes_to_write: 0,
                config_generation: 0,
                tracks: Vec::new(),
                active_tracks: Vec::new(),
                name_mask: 0,
                pending_name_releases: Vec::new(),
                master_volume,
                master_mute,
                stream_types,
                standby: false,
                suspended: false,
                bytes_written: 0,
                num_writes: 0,
                num_delayed_writes: 0,
                in_write: false,
                new_parameters: VecDeque::new(),
                param_status: None,
                config_events: VecDeque::new(),
                output_tracks: Vec::new(),
            }),
        };
        {
            let mut st = thread.lock_state();
            thread.read_output_parameters(&mut st);
            // notify client processes that a new output has been opened
            st.config_events.push_back(PendingEvent::OutputOpened);
        }
        Arc::new(thread)
    }

    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        let name = match self.kind {
            PlaybackKind::Mixer => format!("mixer-{}", self.id),
            PlaybackKind::Direct => format!("direct-{}", self.id),
            PlaybackKind::Duplicating => format!("dup-{}", self.id),
        };
        std::thread::Builder::new()
            .name(name)
            .spawn(move || me.run())
            .expect("failed to spawn playback thread")
    }

    fn lock_state(&self) -> MutexGuard<'_, PlaybackState> {
        self.core.lock()
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn kind(&self) -> PlaybackKind {
        self.kind
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock_state().sample_rate
    }

    pub fn channel_count(&self) -> u32 {
        self.lock_state().channel_count
    }

    pub fn format(&self) -> SampleFormat {
        self.lock_state().format
    }

    pub fn frame_count(&self) -> usize {
        self.lock_state().frame_count
    }

    pub fn latency_ms(&self) -> u32 {
        self.stream.latency_ms()
    }

    pub(crate) fn stream(&self) -> Arc<dyn StreamOut> {
        self.stream.clone()
    }

    pub fn descriptor(&self) -> OutputDescriptor {
        let st = self.lock_state();
        self.descriptor_l(&st)
    }

    fn descriptor_l(&self, st: &PlaybackState) -> OutputDescriptor {
        OutputDescriptor {
            sample_rate: st.sample_rate,
            channel_count: st.channel_count,
            format: st.format,
            frame_count: st.frame_count,
            latency_ms: self.stream.latency_ms(),
        }
    }

    // ------------------------------------------------------------------
    // track lifecycle (control plane)
    // ------------------------------------------------------------------

    /// Create a track bound to this endpoint. Callers hold the server lock.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_track(
        self: &Arc<Self>,
        client: Option<Arc<Client>>,
        stream_type: StreamType,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
        shared_buffer: Option<Vec<i16>>,
    ) -> AudioResult<Arc<Track>> {
        let mut st = self.lock_state();
        match self.kind {
            PlaybackKind::Direct => {
                if sample_rate != st.sample_rate
                    || format != st.format
                    || channel_count != st.channel_count
                {
                    error!(
                        "create_track: bad parameters for direct output {} ({} Hz, {:?}, {} ch)",
                        self.id, sample_rate, format, channel_count
                    );
                    return Err(AudioError::InvalidArgument("direct endpoint mismatch"));
                }
            }
            _ => {
                // the resampler limits input rates to 2x the device rate
                if sample_rate > st.sample_rate * 2 {
                    error!(
                        "create_track: sample rate {} out of range for output at {}",
                        sample_rate, st.sample_rate
                    );
                    return Err(AudioError::InvalidArgument("sample rate out of range"));
                }
            }
        }

        let name = match self.kind {
            PlaybackKind::Direct => 0,
            _ => allocate_name(&mut st.name_mask).ok_or(AudioError::NoMemory)?,
        };
        match Track::new(
            self,
            client,
            stream_type,
            sample_rate,
            format,
            channel_count,
            frame_count,
            flags,
            shared_buffer,
            name,
        ) {
            Ok(track) => {
                st.tracks.push(track.clone());
                Ok(track)
            }
            Err(e) => {
                if self.kind != PlaybackKind::Direct {
                    free_name(&mut st.name_mask, name);
                }
                Err(e)
            }
        }
    }

    fn active_index_l(st: &PlaybackState, track: &Arc<Track>) -> Option<usize> {
        st.active_tracks
            .iter()
            .position(|w| w.upgrade().map(|t| Arc::ptr_eq(&t, track)).unwrap_or(false))
    }

    /// Start (or restart) a track: insert into the active list, reset the
    /// retry budget and re-enter fill-up if it is newly active.
    pub(crate) fn add_track(&self, track: &Arc<Track>) {
        let mut st = self.lock_state();
        if matches!(track.state(), TrackState::Paused | TrackState::Pausing) {
            track.set_state(TrackState::Resuming);
            debug!("PAUSED => RESUMING ({})", track.name());
        } else {
            track.set_state(TrackState::Active);
            debug!("? => ACTIVE ({})", track.name());
        }
        track
            .retry_count
            .store(MAX_TRACK_STARTUP_RETRIES, Ordering::Relaxed);
        if Self::active_index_l(&st, track).is_none() {
            // a newly added track fills all its buffers before playing so
            // the client actually gets the latency it asked for
            track.fill_status.set(FillStatus::Filling);
            track.clear_reset_done();
            st.active_tracks.push(Arc::downgrade(track));
        }
        self.core.notify_work();
    }

    pub(crate) fn stop_track(&self, track: &Arc<Track>) {
        let st = self.lock_state();
        if matches!(
            track.state(),
            TrackState::Active | TrackState::Resuming | TrackState::Pausing | TrackState::Paused
        ) {
            if Self::active_index_l(&st, track).is_some() {
                // the loop drains remaining frames, then removes the track;
                // a loop point would make that drain endless
                track.cblk.clear_loop();
                track.set_state(TrackState::Stopping);
            } else {
                track.set_state(TrackState::Stopped);
                track.reset();
            }
            debug!("=> STOPPED ({})", track.name());
        }
    }

    pub(crate) fn pause_track(&self, track: &Arc<Track>) {
        let _st = self.lock_state();
        if matches!(track.state(), TrackState::Active | TrackState::Resuming) {
            track.set_state(TrackState::Pausing);
            debug!("ACTIVE/RESUMING => PAUSING ({})", track.name());
        }
    }

    pub(crate) fn flush_track(&self, track: &Arc<Track>) -> AudioResult<()> {
        let _st = self.lock_state();
        if !matches!(
            track.state(),
            TrackState::Stopped | TrackState::Paused | TrackState::Pausing | TrackState::Flushed
        ) {
            return Err(AudioError::InvalidOperation);
        }
        track.set_state(TrackState::Flushed);
        // the consumer may be mid-fetch; reset runs under the control-block
        // lock and a torn fetch simply observes an empty ring
        track.reset();
        Ok(())
    }

    /// Handle-drop path: mark terminated; detach immediately when the loop
    /// has nothing left to acknowledge.
    pub(crate) fn destroy_track(&self, track: &Arc<Track>) {
        let mut st = self.lock_state();
        track.set_state(TrackState::Terminated);
        if Self::active_index_l(&st, track).is_none() {
            debug!("destroy: remove track {} from endpoint {}", track.name(), self.id);
            if let Some(pos) = st.tracks.iter().position(|t| Arc::ptr_eq(t, track)) {
                st.tracks.remove(pos);
            }
            if self.kind != PlaybackKind::Direct {
                free_name(&mut st.name_mask, track.name());
                st.pending_name_releases.push(track.name());
            }
        }
    }

    // ------------------------------------------------------------------
    // volumes
    // ------------------------------------------------------------------

    pub fn set_master_volume(&self, volume: f32) {
        self.lock_state().master_volume = volume;
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.lock_state().master_mute = muted;
    }

    pub fn master_volume(&self) -> f32 {
        self.lock_state().master_volume
    }

    pub fn master_mute(&self) -> bool {
        self.lock_state().master_mute
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.lock_state().stream_types[stream.index()].volume = volume;
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.lock_state().stream_types[stream.index()].mute = muted;
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.lock_state().stream_types[stream.index()].volume
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.lock_state().stream_types[stream.index()].mute
    }

    pub fn is_music_active(&self) -> bool {
        let st = self.lock_state();
        st.active_tracks
            .iter()
            .filter_map(|w| w.upgrade())
            .any(|t| t.stream_type() == StreamType::Music)
    }

    pub fn suspend(&self) {
        let mut st = self.lock_state();
        st.suspended = true;
        self.core.notify_work();
    }

    pub fn restore(&self) {
        let mut st = self.lock_state();
        st.suspended = false;
        self.core.notify_work();
    }

    // ------------------------------------------------------------------
    // parameters & events
    // ------------------------------------------------------------------

    /// Queue a key/value change and block until the loop has applied it.
    pub fn set_parameters(&self, params: ParameterMap) -> AudioResult<()> {
        self.core.set_parameters(params)
    }

    pub fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        self.stream.get_parameters(keys)
    }

    pub(crate) fn send_config_event(&self, event: PendingEvent) {
        self.core.send_config_event(event);
    }

    /// Drain queued events and deliver them through the server, one at a
    /// time with the thread lock released; dispatching under the lock would
    /// invert the server/thread rank.
    fn process_config_events(&self) {
        while let Some((event, descriptor)) =
            self.core.pop_config_event(|st| self.descriptor_l(st))
        {
            if let Some(server) = self.server.upgrade() {
                server.io_config_changed(self.id, event, descriptor);
            }
        }
    }

    pub(crate) fn exit(&self) {
        self.core.request_exit();
    }

    pub fn metrics(&self) -> Option<PlaybackMetrics> {
        for _ in 0..DUMP_LOCK_RETRIES {
            if let Ok(st) = self.core.try_lock() {
                return Some(PlaybackMetrics {
                    total_writes: st.num_writes,
                    delayed_writes: st.num_delayed_writes,
                    bytes_written: st.bytes_written,
                    standby: st.standby,
                    active_tracks: st.active_tracks.len(),
                    tracks: st.tracks.len(),
                });
            }
            std::thread::sleep(DUMP_LOCK_SLEEP);
        }
        None
    }

    // ------------------------------------------------------------------
    // stream-type migration (setStreamOutput)
    // ------------------------------------------------------------------

    /// Detach every track of `stream` from this endpoint, remembering which
    /// were active so the destination can preserve their state.
    pub(crate) fn take_tracks(&self, stream: StreamType) -> Vec<(Arc<Track>, bool)> {
        let mut st = self.lock_state();
        let mut moved = Vec::new();
        let mut kept = Vec::with_capacity(st.tracks.len());
        for track in std::mem::take(&mut st.tracks) {
            if track.stream_type() == stream {
                let was_active = Self::active_index_l(&st, &track).is_some();
                moved.push((track, was_active));
            } else {
                kept.push(track);
            }
        }
        st.tracks = kept;
        for (track, was_active) in &moved {
            if *was_active {
                if let Some(pos) = Self::active_index_l(&st, track) {
                    st.active_tracks.remove(pos);
                }
            }
            if self.kind != PlaybackKind::Direct {
                free_name(&mut st.name_mask, track.name());
                st.pending_name_releases.push(track.name());
            }
        }
        moved
    }

    /// Attach migrated tracks, assigning fresh mixer names and restoring
    /// active status. Tracks that cannot get a name are dropped after the
    /// lock is released.
    pub(crate) fn put_tracks(self: &Arc<Self>, moved: Vec<(Arc<Track>, bool)>) {
        let mut overflow: Vec<(Arc<Track>, bool)> = Vec::new();
        {
            let mut st = self.lock_state();
            let mut moved = moved.into_iter();
            while let Some((track, was_active)) = moved.next() {
                let Some(name) = allocate_name(&mut st.name_mask) else {
                    warn!("put_tracks: endpoint {} out of mixer names", self.id);
                    overflow.push((track, was_active));
                    overflow.extend(moved);
                    break;
                };
                track.set_name(name);
                track.rebind_thread(self);
                if was_active {
                    st.active_tracks.push(Arc::downgrade(&track));
                }
                st.tracks.push(track);
            }
            self.core.notify_work();
        }
        drop(overflow);
    }

    // ------------------------------------------------------------------
    // duplicating fan-out
    // ------------------------------------------------------------------

    pub(crate) fn add_output_track(self: &Arc<Self>, dest: &Arc<PlaybackThread>) -> AudioResult<()> {
        debug_assert_eq!(self.kind, PlaybackKind::Duplicating);
        let (src_frame_count, src_rate, src_format) = {
            let st = self.lock_state();
            (st.frame_count, st.sample_rate, st.format)
        };
        let (dst_rate, dst_frame_count) = {
            let st = dest.lock_state();
            (st.sample_rate.max(1), st.frame_count)
        };
        // sized to ride out roughly three source buffers at the destination
        // cadence
        let frame_count =
            (3 * src_frame_count as u64 * src_rate as u64 / dst_rate as u64).max(1) as u32;
        let track = dest.create_track(
            None,
            StreamType::Bridge,
            src_rate,
            src_format,
            2,
            frame_count,
            0,
            None,
        )?;
        dest.set_stream_volume(StreamType::Bridge, 1.0);
        let wait = Duration::from_millis(2 * dst_frame_count as u64 * 1000 / dst_rate as u64);
        let output_track = OutputTrack::new(track, wait);
        self.lock_state().output_tracks.push(output_track);
        info!(
            "🔀 {}: endpoint {} now feeds endpoint {}",
            "DUPLICATE".cyan(),
            self.id,
            dest.id()
        );
        Ok(())
    }

    pub(crate) fn remove_output_track(&self, dest: &Arc<PlaybackThread>) {
        let removed = {
            let mut st = self.lock_state();
            match st.output_tracks.iter().position(|ot| ot.feeds(dest)) {
                Some(pos) => Some(st.output_tracks.remove(pos)),
                None => None,
            }
        };
        match removed {
            // stopping takes the destination thread's lock; ours is already
            // released
            Some(ot) => ot.stop(),
            None => debug!("remove_output_track: endpoint {} not a destination", dest.id()),
        }
    }

    // ------------------------------------------------------------------
    // the real-time loop
    // ------------------------------------------------------------------

    fn run(self: Arc<Self>) {
        info!(
            "🎚️ {}: playback thread {} ({:?}) running",
            "PLAYBACK".green(),
            self.id,
            self.kind
        );
        let mut mixer: Option<SampleMixer> = None;
        let mut mix_buffer: Vec<i16> = Vec::new();
        let mut device_channels = 2usize;
        let mut generation = 0u64;
        let mut sleep_time = BUFFER_RECOVERY;
        let mut standby_time = Instant::now();
        let mut direct_volume = (-1.0f32, -1.0f32);

        'main: while !self.core.exit_pending() {
            self.process_config_events();

            let mut cycle = Cycle::Sleep;
            let mut output_tracks: Vec<Arc<OutputTrack>> = Vec::new();
            let mut suspended = false;
            // removed tracks are dropped here, after the lock is released: a
            // final Track drop can cascade into the client record, which
            // talks to the server
            let mut removed_tracks: Vec<Arc<Track>> = Vec::new();

            {
                let mut st = self.lock_state();
                st = self.check_for_new_parameters(st);

                if generation != st.config_generation {
                    generation = st.config_generation;
                    device_channels = st.channel_count.max(1) as usize;
                    match self.kind {
                        PlaybackKind::Direct => {
                            mix_buffer = vec![0; st.frame_count * device_channels];
                        }
                        _ => {
                            let fc = st.frame_count;
                            let rate = st.sample_rate;
                            match mixer.as_mut() {
                                Some(m) => m.reconfigure(fc, rate),
                                None => mixer = Some(SampleMixer::new(fc, rate)),
                            }
                            mix_buffer = vec![0; fc * 2];
                        }
                    }
                }
                if let Some(m) = mixer.as_mut() {
                    for name in st.pending_name_releases.drain(..) {
                        m.release(name);
                    }
                } else {
                    st.pending_name_releases.clear();
                }

                if self.kind == PlaybackKind::Duplicating {
                    output_tracks = st.output_tracks.clone();
                }
                suspended = st.suspended;

                // put the endpoint into standby after sustained inactivity
                let now = Instant::now();
                if (st.active_tracks.is_empty() && now >= standby_time) || st.suspended {
                    if !st.standby {
                        st.standby = true;
                        st.bytes_written = 0;
                        if self.kind == PlaybackKind::Duplicating {
                            let destinations = output_tracks.clone();
                            drop(st);
                            for ot in &destinations {
                                ot.stop();
                            }
                            st = self.lock_state();
                        } else {
                            debug!("endpoint {} entering standby", self.id);
                            self.stream.standby();
                        }
                    }

                    if st.active_tracks.is_empty() && st.config_events.is_empty() {
                        if self.core.exit_pending() {
                            break 'main;
                        }
                        audio_debug!("playback thread {} going to sleep", self.id);
                        st = self.core.wait_for_work(st);
                        audio_debug!("playback thread {} waking up", self.id);

                        if !st.master_mute && silent_mode_requested() {
                            info!("Silence is golden");
                            st.master_mute = true;
                        }
                        standby_time = Instant::now() + STANDBY_TIMEOUT;
                        continue 'main;
                    }
                }

                match self.kind {
                    PlaybackKind::Direct => {
                        let (keep, removed) =
                            self.prepare_direct_l(&mut st, &mut direct_volume);
                        removed_tracks = removed;
                        if let Some(track) = keep {
                            cycle = Cycle::Direct(track);
                        }
                    }
                    _ => {
                        let m = mixer.as_mut().expect("mixer configured before prepare");
                        let (enabled, removed) = self.prepare_tracks_l(&mut st, m);
                        removed_tracks = removed;
                        if enabled > 0 {
                            cycle = Cycle::Mix;
                        }
                    }
                }
            } // thread lock released

            match cycle {
                Cycle::Mix => {
                    let m = mixer.as_mut().expect("mixer configured");
                    m.process(&mut mix_buffer);
                    match self.kind {
                        PlaybackKind::Duplicating => {
                            if suspended {
                                std::thread::sleep(MAX_BUFFER_RECOVERY);
                            } else {
                                let frames = mix_buffer.len() / 2;
                                for ot in &output_tracks {
                                    ot.write(&mix_buffer, frames);
                                }
                                let mut st = self.lock_state();
                                st.standby = false;
                                st.bytes_written += (mix_buffer.len() * 2) as u64;
                                sleep_time = BUFFER_RECOVERY;
                            }
                        }
                        _ => {
                            if suspended {
                                std::thread::sleep(MAX_BUFFER_RECOVERY);
                            } else {
                                self.write_block(&mix_buffer, &mut standby_time);
                                sleep_time = BUFFER_RECOVERY;
                            }
                        }
                    }
                }
                Cycle::Direct(track) => {
                    self.drain_direct(&track, &mut mix_buffer, device_channels);
                    if suspended {
                        std::thread::sleep(MAX_BUFFER_RECOVERY);
                    } else {
                        self.write_block(&mix_buffer, &mut standby_time);
                        sleep_time = BUFFER_RECOVERY;
                    }
                }
                Cycle::Sleep => {
                    let mut must_sleep = true;
                    if self.kind == PlaybackKind::Duplicating {
                        // flush remaining overflow buffers in output tracks
                        for ot in &output_tracks {
                            if ot.is_active() {
                                ot.write(&mix_buffer, 0);
                                standby_time = Instant::now() + STANDBY_TIMEOUT;
                                must_sleep = false;
                            }
                        }
                    }
                    if must_sleep {
                        // nothing was ready; give late tracks another chance,
                        // backing off so an idle endpoint stays cheap
                        std::thread::sleep(sleep_time);
                        if sleep_time < MAX_BUFFER_RECOVERY {
                            sleep_time += BUFFER_RECOVERY;
                        }
                    } else {
                        sleep_time = BUFFER_RECOVERY;
                    }
                }
            }

            removed_tracks.clear();
        }

        // orderly exit: quiesce the sink, then tell observers
        let (was_standby, destinations) = {
            let st = self.lock_state();
            (st.standby, st.output_tracks.clone())
        };
        if !was_standby {
            if self.kind == PlaybackKind::Duplicating {
                for ot in &destinations {
                    ot.stop();
                }
            } else {
                self.stream.standby();
            }
        }
        self.send_config_event(PendingEvent::OutputClosed);
        self.process_config_events();
        info!("playback thread {} exiting", self.id);
    }

    /// Blocking device write plus bookkeeping; flags writes stalled past
    /// two buffer periods.
    fn write_block(&self, block: &[i16], standby_time: &mut Instant) {
        let write_start = Instant::now();
        {
            let mut st = self.lock_state();
            st.in_write = true;
        }
        let written = self.stream.write(block);
        let now = Instant::now();
        let mut st = self.lock_state();
        st.in_write = false;
        st.num_writes += 1;
        st.standby = false;
        match written {
            Ok(samples) => st.bytes_written += (samples * 2) as u64,
            Err(e) => audio_debug!("device write failed on endpoint {}: {e}", self.id),
        }
        let max_period = Duration::from_nanos(
            st.frame_count as u64 * 2_000_000_000 / st.sample_rate.max(1) as u64,
        );
        if now.duration_since(write_start) > max_period {
            warn!(
                "🐌 {}: write blocked for {} ms on endpoint {}",
                "DELAYED_WRITE".red(),
                now.duration_since(write_start).as_millis(),
                self.id
            );
            st.num_delayed_writes += 1;
        }
        *standby_time = now + STANDBY_TIMEOUT;
    }

    /// Walk the active list and program the mixer: ready tracks get their
    /// volume/format/rate, late ones burn retries, finished ones are pruned.
    /// Returns the number of enabled tracks plus the removed tracks, whose
    /// final strong references must not die under the thread lock.
    fn prepare_tracks_l(
        &self,
        st: &mut PlaybackState,
        mixer: &mut SampleMixer,
    ) -> (usize, Vec<Arc<Track>>) {
        let mut enabled = 0usize;
        let mut to_remove: Vec<Arc<Track>> = Vec::new();

        let active: Vec<Arc<Track>> =
            st.active_tracks.iter().filter_map(|w| w.upgrade()).collect();
        for track in active {
            let name = track.name();
            let cblk = &track.cblk;
            let state = track.state();
            let draining = matches!(state, TrackState::Stopping | TrackState::Stopped);

            if cblk.frames_ready() > 0
                && (track.is_ready() || draining)
                && !matches!(state, TrackState::Paused | TrackState::Flushed)
            {
                // compute this track's gain
                let stream_slot = st.stream_types[track.stream_type().index()];
                let (left, right) = if track.is_muted()
                    || st.master_mute
                    || stream_slot.mute
                    || state == TrackState::Pausing
                {
                    if state == TrackState::Pausing {
                        track.set_state(TrackState::Paused);
                        debug!("PAUSING => PAUSED ({})", name);
                    }
                    (0u16, 0u16)
                } else {
                    let v = st.master_volume * stream_slot.volume;
                    let cvol = cblk.volume();
                    (
                        (v * cvol[0] as f32).clamp(0.0, MAX_GAIN) as u16,
                        (v * cvol[1] as f32).clamp(0.0, MAX_GAIN) as u16,
                    )
                };

                mixer.set_provider(
                    name,
                    TrackFeed::source_id(&track),
                    Box::new(TrackFeed::new(track.clone())),
                );
                mixer.enable(name);

                // FILLED is a one-cycle acknowledgement: the first volume of
                // a fresh start applies instantly, everything else ramps
                let mut ramp = true;
                if track.fill_status.get() == FillStatus::Filled {
                    track.fill_status.set(FillStatus::Active);
                    if track.state() == TrackState::Resuming {
                        track.set_state(TrackState::Active);
                    } else {
                        ramp = false;
                    }
                }
                mixer.set_volume(name, left, right, ramp);
                mixer.set_format(name, track.format(), cblk.channel_count());
                mixer.set_input_rate(name, cblk.sample_rate());

                track.retry_count.store(MAX_TRACK_RETRIES, Ordering::Relaxed);
                enabled += 1;
            } else {
                if state == TrackState::Stopping && cblk.frames_ready() == 0 {
                    // drained: the ring resets once, the state settles
                    track.reset();
                    track.set_state(TrackState::Stopped);
                }
                let state = track.state();
                if matches!(
                    state,
                    TrackState::Terminated
                        | TrackState::Stopped
                        | TrackState::Flushed
                        | TrackState::Paused
                ) {
                    to_remove.push(track.clone());
                    mixer.disable(name);
                } else {
                    let retries = track.retry_count.fetch_sub(1, Ordering::AcqRel) - 1;
                    if retries <= 0 {
                        audio_debug!("BUFFER TIMEOUT: remove ({}) from active list", name);
                        to_remove.push(track.clone());
                    }
                    // a static clip must see one hardware-latency of output
                    // before it may be silenced, so short sounds always play
                    if !track.is_static() || st.bytes_written >= st.min_bytes_to_write {
                        mixer.disable(name);
                    } else {
                        enabled += 1;
                    }
                }
            }
        }

        for track in &to_remove {
            if let Some(pos) = Self::active_index_l(st, track) {
                st.active_tracks.remove(pos);
            }
            if track.state() == TrackState::Terminated {
                if let Some(pos) = st.tracks.iter().position(|t| Arc::ptr_eq(t, track)) {
                    st.tracks.remove(pos);
                }
                free_name(&mut st.name_mask, track.name());
                mixer.release(track.name());
            }
        }
        (enabled, to_remove)
    }

    /// Direct flavor: only the first active track plays; volume goes to the
    /// hardware, and the freshly applied values are what we cache.
    fn prepare_direct_l(
        &self,
        st: &mut PlaybackState,
        applied_volume: &mut (f32, f32),
    ) -> (Option<Arc<Track>>, Vec<Arc<Track>>) {
        let Some(track) = st.active_tracks.first().and_then(|w| w.upgrade()) else {
            return (None, Vec::new());
        };
        let cblk = &track.cblk;
        let state = track.state();
        let draining = matches!(state, TrackState::Stopping | TrackState::Stopped);

        if cblk.frames_ready() > 0
            && (track.is_ready() || draining)
            && !matches!(state, TrackState::Paused | TrackState::Flushed)
        {
            let stream_slot = st.stream_types[track.stream_type().index()];
            let (left, right) = if track.is_muted()
                || st.master_mute
                || stream_slot.mute
                || state == TrackState::Pausing
            {
                if state == TrackState::Pausing {
                    track.set_state(TrackState::Paused);
                }
                (0.0, 0.0)
            } else {
                let v = st.master_volume * stream_slot.volume;
                let cvol = cblk.volume();
                (
                    (v * cvol[0] as f32).clamp(0.0, MAX_GAIN) / MAX_GAIN,
                    (v * cvol[1] as f32).clamp(0.0, MAX_GAIN) / MAX_GAIN,
                )
            };
            if (left, right) != *applied_volume {
                if let Err(e) = self.stream.set_volume(left, right) {
                    audio_debug!("direct volume refused: {e}");
                }
                *applied_volume = (left, right);
            }

            if track.fill_status.get() == FillStatus::Filled {
                track.fill_status.set(FillStatus::Active);
                if track.state() == TrackState::Resuming {
                    track.set_state(TrackState::Active);
                }
            }
            track.retry_count.store(MAX_TRACK_RETRIES, Ordering::Relaxed);
            (Some(track), Vec::new())
        } else {
            if state == TrackState::Stopping && cblk.frames_ready() == 0 {
                track.reset();
                track.set_state(TrackState::Stopped);
            }
            let state = track.state();
            let mut keep: Option<Arc<Track>> = None;
            let mut removed: Vec<Arc<Track>> = Vec::new();
            let mut remove = matches!(
                state,
                TrackState::Terminated
                    | TrackState::Stopped
                    | TrackState::Flushed
                    | TrackState::Paused
            );
            if !remove {
                let retries = track.retry_count.fetch_sub(1, Ordering::AcqRel) - 1;
                if retries <= 0 {
                    audio_debug!("BUFFER TIMEOUT: remove ({}) from active list", track.name());
                    remove = true;
                }
                if track.is_static() && st.bytes_written < st.min_bytes_to_write {
                    keep = Some(track.clone());
                }
            }
            if remove {
                if let Some(pos) = Self::active_index_l(st, &track) {
                    st.active_tracks.remove(pos);
                }
                if track.state() == TrackState::Terminated {
                    if let Some(pos) = st.tracks.iter().position(|t| Arc::ptr_eq(t, &track)) {
                        st.tracks.remove(pos);
                    }
                }
                removed.push(track);
            }
            (keep, removed)
        }
    }

    /// Copy provider frames straight into the device block, zero-filling on
    /// a short pull.
    fn drain_direct(&self, track: &Arc<Track>, block: &mut [i16], channels: usize) {
        let frames = block.len() / channels;
        let mut feed = TrackFeed::new(track.clone());
        let mut buffer = AudioBuffer::empty();
        let mut filled = 0usize;
        while filled < frames {
            pull(&mut feed, &mut buffer, frames - filled);
            if buffer.is_empty() {
                block[filled * channels..].fill(0);
                break;
            }
            // SAFETY: live provider buffer until release below.
            let samples = unsafe { buffer.as_slice(channels) };
            block[filled * channels..][..samples.len()].copy_from_slice(samples);
            filled += buffer.frame_count;
            feed.release_buffer(&mut buffer);
        }
    }

    /// Apply queued parameter changes under the thread lock, answering each
    /// caller through the param/work condvar handshake. Reconfigurations
    /// re-read the output parameters, reassign mixer names and queue an
    /// OUTPUT_CONFIG_CHANGED event.
    fn check_for_new_parameters<'a>(
        &'a self,
        mut st: MutexGuard<'a, PlaybackState>,
    ) -> MutexGuard<'a, PlaybackState> {
        while let Some(params) = st.new_parameters.pop_front() {
            let mut status: AudioResult<()> = Ok(());
            let mut reconfig = false;

            if params.get_int(KEY_SAMPLING_RATE).is_some() && self.kind != PlaybackKind::Direct {
                reconfig = true;
            }
            if let Some(format) = params.get_format() {
                match format {
                    Ok(SampleFormat::Pcm16) if self.kind != PlaybackKind::Direct => reconfig = true,
                    Ok(_) if self.kind != PlaybackKind::Direct => {
                        status = Err(AudioError::InvalidArgument("mixer output must be pcm16"))
                    }
                    Ok(_) => {}
                    Err(e) => status = Err(e),
                }
            }
            if let Some(channels) = params.get_int(KEY_CHANNELS) {
                if self.kind != PlaybackKind::Direct {
                    if channels == 2 {
                        reconfig = true;
                    } else {
                        status = Err(AudioError::InvalidArgument("mixer output must be stereo"));
                    }
                }
            }
            if params.get_int(KEY_FRAME_COUNT).is_some() {
                // track rings are sized from the frame count at creation;
                // changing it under live tracks cannot be honored
                if !st.tracks.is_empty() {
                    status = Err(AudioError::InvalidOperation);
                } else {
                    reconfig = true;
                }
            }

            if status.is_ok() {
                let mut applied = self.stream.set_parameters(&params);
                if matches!(applied, Err(AudioError::InvalidOperation)) && !st.standby {
                    self.stream.standby();
                    st.standby = true;
                    st.bytes_written = 0;
                    applied = self.stream.set_parameters(&params);
                }
                status = applied;
                if status.is_ok() && reconfig {
                    self.read_output_parameters(&mut st);
                    if self.kind != PlaybackKind::Direct {
                        st.name_mask = 0;
                        st.pending_name_releases.clear();
                        let tracks = st.tracks.clone();
                        for track in tracks {
                            match allocate_name(&mut st.name_mask) {
                                Some(name) => track.set_name(name),
                                None => break,
                            }
                        }
                    }
                    st.config_events.push_back(PendingEvent::OutputConfigChanged);
                }
            }

            st = self.core.answer_parameters(st, status);
        }
        st
    }

    fn read_output_parameters(&self, st: &mut PlaybackState) {
        st.sample_rate = self.stream.sample_rate();
        st.channel_count = self.stream.channel_count();
        st.format = self.stream.format();
        st.frame_size = self.stream.frame_size().max(1);
        st.frame_count = (self.stream.buffer_size() / st.frame_size).max(1);
        st.min_bytes_to_write =
            self.stream.latency_ms() as u64 * st.sample_rate as u64 * st.frame_size as u64 / 1000;
        st.config_generation += 1;
        if self.kind != PlaybackKind::Direct && st.channel_count != 2 {
            // the software mixer emits stereo; a mono sink would truncate
            error!("invalid hardware channel count {} for mixed output", st.channel_count);
        }
    }
}

impl std::fmt::Debug for PlaybackThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackThread")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
