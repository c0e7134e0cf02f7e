// Server core: the endpoint registry, client bookkeeping, stream routing
// and the observer fan-out. The server lock sits at the top of the rank;
// nothing here is ever called from a real-time loop while that loop holds
// its own lock, except `io_config_changed`, which the loops call with their
// locks released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use colored::Colorize;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::audio::client::Client;
use crate::audio::events::{IoConfigEvent, IoNotification, PendingEvent};
use crate::audio::handle::{RecordHandle, TrackHandle};
use crate::audio::hardware::AudioHwDevice;
use crate::audio::params::ParameterMap;
use crate::audio::threads::{PlaybackKind, PlaybackThread, RecordThread};
use crate::audio::types::{
    output_flags, AudioError, AudioMode, AudioResult, EndpointConfig, EndpointId,
    OutputDescriptor, Pid, SampleFormat, StreamType, StreamVolume, DUMP_LOCK_RETRIES,
    DUMP_LOCK_SLEEP,
};

struct PlaybackEntry {
    thread: Arc<PlaybackThread>,
    join: Option<JoinHandle<()>>,
}

struct RecordEntry {
    thread: Arc<RecordThread>,
    join: Option<JoinHandle<()>>,
}

struct ServerState {
    playback: BTreeMap<EndpointId, PlaybackEntry>,
    records: BTreeMap<EndpointId, RecordEntry>,
    clients: HashMap<Pid, Weak<Client>>,
    next_id: EndpointId,
    master_volume: f32,
    master_mute: bool,
    stream_types: [StreamVolume; StreamType::COUNT],
    observers: Vec<Sender<IoNotification>>,
    mode: AudioMode,
}

pub struct AudioServer {
    me: Weak<AudioServer>,
    hw: Arc<dyn AudioHwDevice>,
    hardware_lock: Mutex<()>,
    state: Mutex<ServerState>,
}

impl AudioServer {
    /// Bring the service up against a hardware device. Fails when the
    /// hardware cannot initialize at all.
    pub fn new(hw: Arc<dyn AudioHwDevice>) -> AudioResult<Arc<AudioServer>> {
        hw.init_check()?;
        let server = Arc::new_cyclic(|me| AudioServer {
            me: me.clone(),
            hw,
            hardware_lock: Mutex::new(()),
            state: Mutex::new(ServerState {
                playback: BTreeMap::new(),
                records: BTreeMap::new(),
                clients: HashMap::new(),
                next_id: 0,
                master_volume: 1.0,
                master_mute: false,
                stream_types: [StreamVolume::default(); StreamType::COUNT],
                observers: Vec::new(),
                mode: AudioMode::Normal,
            }),
        });
        let _ = server.set_mode(AudioMode::Normal);
        let _ = server.set_master_volume(1.0);
        server.set_master_mute(false);
        info!("🔊 {}: audio server up", "SERVER".green());
        Ok(server)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn playback_thread(
        st: &ServerState,
        endpoint: EndpointId,
    ) -> AudioResult<Arc<PlaybackThread>> {
        st.playback
            .get(&endpoint)
            .map(|e| e.thread.clone())
            .ok_or(AudioError::BadIndex(endpoint))
    }

    fn record_thread(st: &ServerState, endpoint: EndpointId) -> AudioResult<Arc<RecordThread>> {
        st.records
            .get(&endpoint)
            .map(|e| e.thread.clone())
            .ok_or(AudioError::BadIndex(endpoint))
    }

    fn get_or_create_client(&self, st: &mut ServerState, pid: Pid) -> Arc<Client> {
        if let Some(client) = st.clients.get(&pid).and_then(Weak::upgrade) {
            return client;
        }
        let client = Arc::new(Client::new(self.me.clone(), pid));
        st.clients.insert(pid, Arc::downgrade(&client));
        client
    }

    /// Best-effort cleanup from `Client::drop`. A client can die while some
    /// path already holds the server lock (the final track reference going
    /// away inside a registry operation), so this must never block: a stale
    /// dead weak entry is harmless and is replaced on the next lookup.
    pub(crate) fn remove_client(&self, pid: Pid) {
        debug!("remove_client() pid {}", pid);
        if let Ok(mut st) = self.state.try_lock() {
            let dead = st
                .clients
                .get(&pid)
                .map(|w| w.upgrade().is_none())
                .unwrap_or(false);
            if dead {
                st.clients.remove(&pid);
            }
        }
    }

    // ------------------------------------------------------------------
    // track / record creation
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_track(
        &self,
        pid: Pid,
        stream_type: StreamType,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
        shared_buffer: Option<Vec<i16>>,
        endpoint: EndpointId,
    ) -> AudioResult<TrackHandle> {
        if !stream_type.is_client_type() {
            return Err(AudioError::InvalidArgument("invalid stream type"));
        }
        if !(1..=2).contains(&channel_count) {
            return Err(AudioError::InvalidArgument("channel count"));
        }
        if sample_rate == 0 {
            return Err(AudioError::InvalidArgument("sample rate"));
        }
        if shared_buffer.is_none() && frame_count == 0 {
            return Err(AudioError::InvalidArgument("frame count"));
        }
        if !format.is_linear_pcm() {
            return Err(AudioError::InvalidArgument("format"));
        }

        let mut st = self.lock_state();
        let thread = Self::playback_thread(&st, endpoint)?;
        let client = self.get_or_create_client(&mut st, pid);
        let track = thread.create_track(
            Some(client),
            stream_type,
            sample_rate,
            format,
            channel_count,
            frame_count,
            flags,
            shared_buffer,
        )?;
        Ok(TrackHandle::new(track))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_record(
        &self,
        pid: Pid,
        endpoint: EndpointId,
        sample_rate: u32,
        format: SampleFormat,
        channel_count: u32,
        frame_count: u32,
        flags: u32,
    ) -> AudioResult<RecordHandle> {
        if !(1..=2).contains(&channel_count) {
            return Err(AudioError::InvalidArgument("channel count"));
        }
        if sample_rate == 0 || frame_count == 0 {
            return Err(AudioError::InvalidArgument("rate/frame count"));
        }
        let mut st = self.lock_state();
        let thread = Self::record_thread(&st, endpoint)?;
        let client = self.get_or_create_client(&mut st, pid);
        let track = thread.create_record_track(
            client,
            sample_rate,
            format,
            channel_count,
            frame_count,
            flags,
        )?;
        Ok(RecordHandle::new(track))
    }

    // ------------------------------------------------------------------
    // endpoint lifecycle
    // ------------------------------------------------------------------

    /// Open a playback endpoint. Formats the software mixer cannot handle
    /// (or an explicit direct flag) get a pass-through endpoint instead.
    pub fn open_output(&self, config: &EndpointConfig, flags: u32) -> AudioResult<EndpointId> {
        let stream = {
            let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.hw.open_output_stream(config)?
        };
        let direct = flags & output_flags::DIRECT != 0
            || stream.format() != SampleFormat::Pcm16
            || stream.channel_count() != 2;
        let kind = if direct {
            PlaybackKind::Direct
        } else {
            PlaybackKind::Mixer
        };

        let mut st = self.lock_state();
        st.next_id += 1;
        let id = st.next_id;
        let thread = PlaybackThread::new(
            id,
            kind,
            stream,
            self.me.clone(),
            st.master_volume,
            st.master_mute,
            st.stream_types,
        );
        let join = thread.spawn();
        st.playback.insert(
            id,
            PlaybackEntry {
                thread,
                join: Some(join),
            },
        );
        info!(
            "🔉 {}: opened {:?} output endpoint {}",
            "OUTPUT".cyan(),
            kind,
            id
        );
        Ok(id)
    }

    /// Fan one mix out to two mixer endpoints through a duplicating
    /// endpoint.
    pub fn open_duplicate_output(
        &self,
        output1: EndpointId,
        output2: EndpointId,
    ) -> AudioResult<EndpointId> {
        let mut st = self.lock_state();
        let thread1 = Self::playback_thread(&st, output1)?;
        let thread2 = Self::playback_thread(&st, output2)?;
        if thread1.kind() != PlaybackKind::Mixer || thread2.kind() != PlaybackKind::Mixer {
            warn!(
                "open_duplicate_output: wrong output mixer type for {} or {}",
                output1, output2
            );
            return Err(AudioError::InvalidArgument("not a mixer endpoint"));
        }

        st.next_id += 1;
        let id = st.next_id;
        let thread = PlaybackThread::new(
            id,
            PlaybackKind::Duplicating,
            thread1.stream(),
            self.me.clone(),
            st.master_volume,
            st.master_mute,
            st.stream_types,
        );
        thread.add_output_track(&thread1)?;
        thread.add_output_track(&thread2)?;
        let join = thread.spawn();
        st.playback.insert(
            id,
            PlaybackEntry {
                thread,
                join: Some(join),
            },
        );
        Ok(id)
    }

    pub fn close_output(&self, endpoint: EndpointId) -> AudioResult<()> {
        let mut entry = {
            let mut st = self.lock_state();
            let entry = st
                .playback
                .remove(&endpoint)
                .ok_or(AudioError::BadIndex(endpoint))?;
            if entry.thread.kind() == PlaybackKind::Mixer {
                // duplicating endpoints must stop feeding a closing mixer
                for other in st.playback.values() {
                    if other.thread.kind() == PlaybackKind::Duplicating {
                        other.thread.remove_output_track(&entry.thread);
                    }
                }
            }
            entry
        };
        info!("close_output() {}", endpoint);
        entry.thread.exit();
        if let Some(join) = entry.join.take() {
            let _ = join.join();
        }
        Ok(())
    }

    pub fn open_input(&self, config: &EndpointConfig) -> AudioResult<EndpointId> {
        let input = {
            let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.hw.open_input_stream(config)?
        };
        let req_rate = config.sample_rate.unwrap_or(0);
        let req_channels = config.channel_count.unwrap_or(input.channel_count());
        // the record engine resamples down by at most 2x and adapts mono or
        // stereo; anything further is refused here
        if req_rate != 0 && input.sample_rate() > 2 * req_rate {
            return Err(AudioError::InvalidArgument("input rate out of range"));
        }
        if input.channel_count() > 2 || req_channels > 2 {
            return Err(AudioError::InvalidArgument("input channels"));
        }
        input.standby();

        let mut st = self.lock_state();
        st.next_id += 1;
        let id = st.next_id;
        let thread = RecordThread::new(id, input, self.me.clone(), req_rate, req_channels);
        let join = thread.spawn();
        st.records.insert(
            id,
            RecordEntry {
                thread,
                join: Some(join),
            },
        );
        info!("🎙️ {}: opened input endpoint {}", "INPUT".cyan(), id);
        Ok(id)
    }

    pub fn close_input(&self, endpoint: EndpointId) -> AudioResult<()> {
        let mut entry = {
            let mut st = self.lock_state();
            st.records
                .remove(&endpoint)
                .ok_or(AudioError::BadIndex(endpoint))?
        };
        info!("close_input() {}", endpoint);
        entry.thread.exit();
        if let Some(join) = entry.join.take() {
            let _ = join.join();
        }
        Ok(())
    }

    pub fn suspend_output(&self, endpoint: EndpointId) -> AudioResult<()> {
        let thread = Self::playback_thread(&self.lock_state(), endpoint)?;
        debug!("suspend_output() {}", endpoint);
        thread.suspend();
        Ok(())
    }

    pub fn restore_output(&self, endpoint: EndpointId) -> AudioResult<()> {
        let thread = Self::playback_thread(&self.lock_state(), endpoint)?;
        debug!("restore_output() {}", endpoint);
        thread.restore();
        Ok(())
    }

    pub fn output_descriptor(&self, endpoint: EndpointId) -> AudioResult<OutputDescriptor> {
        let thread = Self::playback_thread(&self.lock_state(), endpoint)?;
        Ok(thread.descriptor())
    }

    pub fn latency_ms(&self, endpoint: EndpointId) -> AudioResult<u32> {
        let thread = Self::playback_thread(&self.lock_state(), endpoint)?;
        Ok(thread.latency_ms())
    }

    // ------------------------------------------------------------------
    // stream routing
    // ------------------------------------------------------------------

    /// Move every track of `stream` onto `endpoint`, preserving active
    /// status, and tell observers. Other stream types keep playing where
    /// they are.
    pub fn set_stream_output(&self, stream: StreamType, endpoint: EndpointId) -> AudioResult<()> {
        if !stream.is_client_type() {
            return Err(AudioError::InvalidArgument("stream type"));
        }
        let st = self.lock_state();
        let dst = Self::playback_thread(&st, endpoint)?;
        if dst.kind() != PlaybackKind::Mixer {
            warn!("set_stream_output() bad endpoint {}", endpoint);
            return Err(AudioError::BadIndex(endpoint));
        }
        info!("set_stream_output() {:?} to endpoint {}", stream, endpoint);

        for entry in st.playback.values() {
            let src = &entry.thread;
            if Arc::ptr_eq(src, &dst) || src.kind() == PlaybackKind::Direct {
                continue;
            }
            let moved = src.take_tracks(stream);
            if !moved.is_empty() {
                dst.put_tracks(moved);
            }
            dst.send_config_event(PendingEvent::StreamConfigChanged(stream));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // volume / mode surface
    // ------------------------------------------------------------------

    pub fn set_master_volume(&self, volume: f32) -> AudioResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::InvalidArgument("master volume"));
        }
        // when the hardware scales master volume itself, the mixers run at
        // unity
        let effective = {
            let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
            if self.hw.set_master_volume(volume).is_ok() {
                1.0
            } else {
                volume
            }
        };
        let st = {
            let mut st = self.lock_state();
            st.master_volume = effective;
            st
        };
        for entry in st.playback.values() {
            entry.thread.set_master_volume(effective);
        }
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.lock_state().master_volume
    }

    pub fn set_master_mute(&self, muted: bool) {
        let st = {
            let mut st = self.lock_state();
            st.master_mute = muted;
            st
        };
        for entry in st.playback.values() {
            entry.thread.set_master_mute(muted);
        }
    }

    pub fn master_mute(&self) -> bool {
        self.lock_state().master_mute
    }

    pub fn set_stream_volume(
        &self,
        stream: StreamType,
        volume: f32,
        endpoint: EndpointId,
    ) -> AudioResult<()> {
        if !stream.is_client_type() {
            return Err(AudioError::InvalidArgument("stream type"));
        }
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::InvalidArgument("stream volume"));
        }

        let mut value = volume;
        if stream == StreamType::VoiceCall {
            {
                let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
                self.hw.set_voice_volume(volume)?;
            }
            // hardware call volume never reaches zero; offset so the stored
            // value round-trips
            value = 0.01 + 0.99 * volume;
        }

        let mut st = self.lock_state();
        st.stream_types[stream.index()].volume = value;
        if endpoint != 0 {
            let thread = Self::playback_thread(&st, endpoint)?;
            thread.set_stream_volume(stream, value);
        } else {
            for entry in st.playback.values() {
                entry.thread.set_stream_volume(stream, value);
            }
        }
        Ok(())
    }

    pub fn stream_volume(&self, stream: StreamType, endpoint: EndpointId) -> AudioResult<f32> {
        let st = self.lock_state();
        let mut volume = if endpoint != 0 {
            Self::playback_thread(&st, endpoint)?.stream_volume(stream)
        } else {
            st.stream_types[stream.index()].volume
        };
        if stream == StreamType::VoiceCall {
            volume = (volume - 0.01) / 0.99;
        }
        Ok(volume)
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) -> AudioResult<()> {
        if !stream.is_client_type() || stream == StreamType::EnforcedAudible {
            return Err(AudioError::InvalidArgument("stream type"));
        }
        let st = {
            let mut st = self.lock_state();
            st.stream_types[stream.index()].mute = muted;
            st
        };
        for entry in st.playback.values() {
            entry.thread.set_stream_mute(stream, muted);
        }
        Ok(())
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.lock_state().stream_types[stream.index()].mute
    }

    pub fn set_mode(&self, mode: AudioMode) -> AudioResult<()> {
        let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.hw.set_mode(mode)?;
        self.lock_state().mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> AudioMode {
        self.lock_state().mode
    }

    pub fn set_mic_mute(&self, muted: bool) -> AudioResult<()> {
        let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.hw.set_mic_mute(muted)
    }

    pub fn mic_mute(&self) -> bool {
        let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.hw.mic_mute()
    }

    pub fn is_music_active(&self) -> bool {
        let st = self.lock_state();
        st.playback.values().any(|e| e.thread.is_music_active())
    }

    // ------------------------------------------------------------------
    // parameters
    // ------------------------------------------------------------------

    /// Endpoint 0 addresses the hardware device itself. Endpoint changes go
    /// through the thread's parameter handshake, which blocks until the
    /// loop has applied them; the server lock is released first.
    pub fn set_parameters(&self, endpoint: EndpointId, params: ParameterMap) -> AudioResult<()> {
        debug!("set_parameters(): endpoint {}, {}", endpoint, params);
        if endpoint == 0 {
            let _hw = self.hardware_lock.lock().unwrap_or_else(|p| p.into_inner());
            return self.hw.set_parameters(&params);
        }

        let playback = {
            let st = self.lock_state();
            Self::playback_thread(&st, endpoint).ok()
        };
        if let Some(thread) = playback {
            return thread.set_parameters(params);
        }
        let record = {
            let st = self.lock_state();
            Self::record_thread(&st, endpoint).ok()
        };
        if let Some(thread) = record {
            return thread.set_parameters(params);
        }
        Err(AudioError::BadIndex(endpoint))
    }

    pub fn get_parameters(&self, endpoint: EndpointId, keys: &[&str]) -> ParameterMap {
        if endpoint == 0 {
            return self.hw.get_parameters(keys);
        }
        let st = self.lock_state();
        if let Ok(thread) = Self::playback_thread(&st, endpoint) {
            return thread.get_parameters(keys);
        }
        if let Ok(thread) = Self::record_thread(&st, endpoint) {
            return thread.get_parameters(keys);
        }
        ParameterMap::new()
    }

    pub fn input_buffer_size(
        &self,
        sample_rate: u32,
        format: SampleFormat,
        channels: u32,
    ) -> usize {
        self.hw.input_buffer_size(sample_rate, format, channels)
    }

    // ------------------------------------------------------------------
    // observers
    // ------------------------------------------------------------------

    /// Register a configuration observer. Existing endpoints announce
    /// themselves so a late client learns the current topology; those
    /// events are delivered from the endpoint threads, never from here.
    pub fn register_client(&self) -> Receiver<IoNotification> {
        let (tx, rx) = unbounded();
        let st = {
            let mut st = self.lock_state();
            st.observers.push(tx);
            st
        };
        for entry in st.playback.values() {
            entry.thread.send_config_event(PendingEvent::OutputOpened);
        }
        for entry in st.records.values() {
            entry.thread.send_config_event(PendingEvent::InputOpened);
        }
        rx
    }

    /// Called by endpoint threads (with their locks released) to fan a
    /// config change out to every observer.
    pub(crate) fn io_config_changed(
        &self,
        endpoint: EndpointId,
        pending: PendingEvent,
        descriptor: OutputDescriptor,
    ) {
        let event = match pending {
            PendingEvent::OutputOpened => IoConfigEvent::OutputOpened(descriptor),
            PendingEvent::OutputClosed => IoConfigEvent::OutputClosed,
            PendingEvent::OutputConfigChanged => IoConfigEvent::OutputConfigChanged(descriptor),
            PendingEvent::StreamConfigChanged(s) => IoConfigEvent::StreamConfigChanged(s),
            PendingEvent::InputOpened => IoConfigEvent::InputOpened(descriptor),
            PendingEvent::InputClosed => IoConfigEvent::InputClosed,
            PendingEvent::InputConfigChanged => IoConfigEvent::InputConfigChanged(descriptor),
        };
        let observers: Vec<Sender<IoNotification>> = self.lock_state().observers.clone();
        let notification = IoNotification { endpoint, event };
        let mut dead: Vec<Sender<IoNotification>> = Vec::new();
        for tx in &observers {
            if tx.send(notification.clone()).is_err() {
                dead.push(tx.clone());
            }
        }
        if !dead.is_empty() {
            // observers whose receiver went away are dropped from the list
            self.lock_state()
                .observers
                .retain(|tx| !dead.iter().any(|d| d.same_channel(tx)));
        }
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Human-readable state snapshot. Uses bounded try-locks so a wedged
    /// server still produces the deadlock marker instead of hanging the
    /// diagnostics path.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut locked = None;
        for _ in 0..DUMP_LOCK_RETRIES {
            match self.state.try_lock() {
                Ok(guard) => {
                    locked = Some(guard);
                    break;
                }
                Err(std::sync::TryLockError::WouldBlock) => std::thread::sleep(DUMP_LOCK_SLEEP),
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    locked = Some(p.into_inner());
                    break;
                }
            }
        }
        let Some(st) = locked else {
            out.push_str("AudioServer may be deadlocked\n");
            return out;
        };

        out.push_str("Clients:\n");
        for (pid, client) in &st.clients {
            if let Some(client) = client.upgrade() {
                out.push_str(&format!(
                    "  pid: {} arena used: {} bytes\n",
                    pid,
                    client.used_bytes()
                ));
            }
        }
        out.push_str(&format!(
            "Master volume: {} mute: {}\n",
            st.master_volume, st.master_mute
        ));
        for (id, entry) in &st.playback {
            match entry.thread.metrics() {
                Some(m) => out.push_str(&format!(
                    "Output {} ({:?}): writes {} delayed {} standby {} tracks {}/{} active\n",
                    id,
                    entry.thread.kind(),
                    m.total_writes,
                    m.delayed_writes,
                    m.standby,
                    m.active_tracks,
                    m.tracks
                )),
                None => out.push_str(&format!("Output {}: thread busy\n", id)),
            }
        }
        for id in st.records.keys() {
            out.push_str(&format!("Input {}\n", id));
        }
        out
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        let (playback, records) = {
            let mut st = self.lock_state();
            (
                std::mem::take(&mut st.playback),
                std::mem::take(&mut st.records),
            )
        };
        for (_, mut entry) in playback {
            entry.thread.exit();
            if let Some(join) = entry.join.take() {
                let _ = join.join();
            }
        }
        for (_, mut entry) in records {
            entry.thread.exit();
            if let Some(join) = entry.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl std::fmt::Debug for AudioServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AudioServer")
    }
}
