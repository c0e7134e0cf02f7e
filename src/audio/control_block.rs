// Shared control block: the single-producer/single-consumer ring contract
// between one client and the server for a single track or record.
//
// The fast path is lock-free: the producer fills frames then advances `user`
// with release ordering; the consumer acquires `user`, processes up to
// `user - server` frames, then releases `server`. The mutex/condvar pair is
// the cooperative slow path for blocking waits, and the consumer only ever
// *tries* the mutex before stepping so a crashed or hostile producer cannot
// wedge a real-time thread.
//
// Cursor layout: `user`/`server` are free-running u32 counters; the matching
// `*_base` values advance in whole-buffer steps so that `cursor - base` is
// always a frame offset in [0, frame_count]. All cursor arithmetic is
// wrapping, which makes natural u32 wrap indistinguishable from monotone
// increase.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use crate::audio::types::{AudioError, AudioResult, SampleFormat, CBLK_WAIT_TIMEOUT, UNITY_GAIN};

const LOOP_NONE: u32 = u32::MAX;

enum Storage {
    /// Server-allocated ring, written by the producer side and read by the
    /// consumer side under the cursor protocol.
    Ring(UnsafeCell<Box<[i16]>>),
    /// Client-supplied static clip for one-shot playback; never written
    /// after creation.
    Static(Box<[i16]>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Ring(cell) => unsafe { (&*cell.get()).len() },
            Storage::Static(data) => data.len(),
        }
    }
}

pub struct ControlBlock {
    frame_count: u32,
    channels: u32,
    frame_size: usize,
    out: bool,
    sample_rate: AtomicU32,

    user: AtomicU32,
    user_base: AtomicU32,
    server: AtomicU32,
    server_base: AtomicU32,

    volume: [AtomicU16; 2],
    loop_end: AtomicU32,
    flow_control: AtomicU32,
    force_ready: AtomicBool,

    lock: Mutex<()>,
    cv: Condvar,

    storage: Storage,
}

// SAFETY: the ring storage is only ever accessed through bounds-checked
// regions derived from the cursors. The producer writes [user, user+n) while
// the consumer reads [server, server+n); the protocol keeps
// user - server in [0, frame_count] so the regions are disjoint, exactly the
// discipline an SPSC ring crate relies on.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    /// Playback ring: server-owned zeroed buffer, producer is the client.
    /// The flow-control flag starts raised so the client does not see a
    /// spurious underrun before it has written anything.
    pub fn new_out(frame_count: u32, sample_rate: u32, channels: u32, format: SampleFormat) -> Self {
        let storage = vec![0i16; frame_count as usize * channels as usize].into_boxed_slice();
        Self::with_storage(
            Storage::Ring(UnsafeCell::new(storage)),
            frame_count,
            sample_rate,
            channels,
            format,
            true,
        )
    }

    /// Record ring: producer is the server-side record thread.
    pub fn new_in(frame_count: u32, sample_rate: u32, channels: u32, format: SampleFormat) -> Self {
        let storage = vec![0i16; frame_count as usize * channels as usize].into_boxed_slice();
        Self::with_storage(
            Storage::Ring(UnsafeCell::new(storage)),
            frame_count,
            sample_rate,
            channels,
            format,
            false,
        )
    }

    /// Static one-shot clip: the whole buffer counts as produced up front,
    /// so a newly started track is ready immediately and `loop_end` can wrap
    /// the consumer early for sub-clip looping.
    pub fn new_static(data: Vec<i16>, sample_rate: u32, channels: u32, format: SampleFormat) -> Self {
        let frame_count = (data.len() / channels.max(1) as usize) as u32;
        let cblk = Self::with_storage(
            Storage::Static(data.into_boxed_slice()),
            frame_count,
            sample_rate,
            channels,
            format,
            true,
        );
        cblk.user.store(frame_count, Ordering::Release);
        cblk.flow_control.store(0, Ordering::Relaxed);
        cblk
    }

    fn with_storage(
        storage: Storage,
        frame_count: u32,
        sample_rate: u32,
        channels: u32,
        format: SampleFormat,
        out: bool,
    ) -> Self {
        ControlBlock {
            frame_count,
            channels,
            // 8-bit PCM is up-converted by the client before it reaches the
            // ring, so the frame size is computed as if 16-bit.
            frame_size: channels as usize * format.ring_bytes_per_sample(),
            out,
            sample_rate: AtomicU32::new(sample_rate),
            user: AtomicU32::new(0),
            user_base: AtomicU32::new(0),
            server: AtomicU32::new(0),
            server_base: AtomicU32::new(0),
            volume: [AtomicU16::new(UNITY_GAIN), AtomicU16::new(UNITY_GAIN)],
            loop_end: AtomicU32::new(LOOP_NONE),
            flow_control: AtomicU32::new(1),
            force_ready: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            storage,
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn channel_count(&self) -> u32 {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn is_out(&self) -> bool {
        self.out
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn volume(&self) -> [u16; 2] {
        [
            self.volume[0].load(Ordering::Relaxed),
            self.volume[1].load(Ordering::Relaxed),
        ]
    }

    pub fn set_volume(&self, left: u16, right: u16) {
        self.volume[0].store(left, Ordering::Relaxed);
        self.volume[1].store(right, Ordering::Relaxed);
    }

    /// Early-wrap point for the consumer, as an absolute cursor position
    /// within the first buffer pass. Meaningful for static clips.
    pub fn set_loop_end(&self, loop_end: u32) {
        self.loop_end.store(loop_end, Ordering::Relaxed);
    }

    pub fn clear_loop(&self) {
        self.loop_end.store(LOOP_NONE, Ordering::Relaxed);
    }

    pub fn loop_end(&self) -> Option<u32> {
        match self.loop_end.load(Ordering::Relaxed) {
            LOOP_NONE => None,
            v => Some(v),
        }
    }

    pub fn set_force_ready(&self) {
        self.force_ready.store(true, Ordering::Relaxed);
    }

    pub fn take_force_ready(&self) -> bool {
        self.force_ready.swap(false, Ordering::Relaxed)
    }

    pub fn flow_control_flag(&self) -> bool {
        self.flow_control.load(Ordering::Relaxed) != 0
    }

    pub fn raise_flow_control(&self) {
        self.flow_control.store(1, Ordering::Relaxed);
    }

    pub fn user(&self) -> u32 {
        self.user.load(Ordering::Acquire)
    }

    pub fn server(&self) -> u32 {
        self.server.load(Ordering::Acquire)
    }

    pub fn user_base(&self) -> u32 {
        self.user_base.load(Ordering::Relaxed)
    }

    pub fn server_base(&self) -> u32 {
        self.server_base.load(Ordering::Relaxed)
    }

    fn pending(&self) -> u32 {
        let u = self.user.load(Ordering::Acquire);
        let s = self.server.load(Ordering::Acquire);
        if self.out {
            u.wrapping_sub(s)
        } else {
            s.wrapping_sub(u)
        }
    }

    /// Frames the consumer may process right now.
    pub fn frames_ready(&self) -> u32 {
        self.pending().min(self.frame_count)
    }

    /// Frames of space left for the producer.
    pub fn frames_available(&self) -> u32 {
        self.frame_count - self.frames_ready()
    }

    /// Contiguous frames the consumer may fetch from `server` before
    /// hitting the buffer end or the loop point.
    pub fn server_fetch_limit(&self) -> u32 {
        let s = self.server.load(Ordering::Acquire);
        let base = self.server_base.load(Ordering::Relaxed);
        let rel = s.wrapping_sub(base).min(self.frame_count);
        let mut end = self.frame_count;
        if let Some(le) = self.loop_end() {
            let le_rel = le.wrapping_sub(base);
            if le_rel < end {
                end = le_rel;
            }
        }
        end.saturating_sub(rel)
    }

    /// Advance the user cursor. On the playback side this publishes produced
    /// frames; on the record side it retires consumed frames. Either way the
    /// flow-control gate drops once the client has moved at least one frame.
    pub fn step_user(&self, frames: u32) {
        if frames == 0 {
            return;
        }
        let mut frames = frames;
        if !self.out {
            // record consumer must not pass the producer
            frames = frames.min(self.pending());
        }
        let u = self.user.load(Ordering::Relaxed).wrapping_add(frames);
        let base = self.user_base.load(Ordering::Relaxed);
        if u.wrapping_sub(base) >= self.frame_count {
            self.user_base
                .store(base.wrapping_add(self.frame_count), Ordering::Relaxed);
        }
        self.user.store(u, Ordering::Release);
        self.flow_control.store(0, Ordering::Relaxed);
    }

    /// Consumer-side cursor advance. Takes the control-block mutex with a
    /// non-blocking attempt; returns false without touching the cursors if
    /// the producer side is holding it.
    pub fn try_step_server(&self, frames: u32) -> bool {
        let guard = match self.lock.try_lock() {
            Ok(g) => g,
            Err(std::sync::TryLockError::WouldBlock) => return false,
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        };
        let mut s = self.server.load(Ordering::Relaxed).wrapping_add(frames);
        let mut base = self.server_base.load(Ordering::Relaxed);
        if self.out {
            if let Some(le) = self.loop_end() {
                let rel = s.wrapping_sub(base);
                let le_rel = le.wrapping_sub(base);
                if rel >= le_rel && le_rel <= self.frame_count {
                    // wrap back to the start of the pass for sub-clip loops
                    s = base.wrapping_add(rel - le_rel);
                }
            }
            let u = self.user.load(Ordering::Acquire);
            if u.wrapping_sub(s) > self.frame_count {
                // a flush reset the cursors while this step was in flight;
                // fall back in line with the producer instead of running
                // ahead of it
                s = u;
                base = self.user_base.load(Ordering::Relaxed);
            }
        }
        if s.wrapping_sub(base) >= self.frame_count {
            base = base.wrapping_add(self.frame_count);
        }
        self.server_base.store(base, Ordering::Relaxed);
        self.server.store(s, Ordering::Release);
        self.cv.notify_all();
        drop(guard);
        true
    }

    /// Reset both cursors to their bases under the control-block lock and
    /// re-arm the flow-control gate. Used by flush and by stop-outside-the-
    /// active-list; a concurrent consumer fetch observes an empty ring, not
    /// a torn one.
    pub fn reset(&self) {
        let guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.user.store(0, Ordering::Release);
        self.server.store(0, Ordering::Release);
        self.user_base.store(0, Ordering::Relaxed);
        self.server_base.store(0, Ordering::Relaxed);
        self.loop_end.store(LOOP_NONE, Ordering::Relaxed);
        self.force_ready.store(false, Ordering::Relaxed);
        self.flow_control.store(1, Ordering::Relaxed);
        drop(guard);
    }

    /// Bounds-checked pointer to `frames` frames at the consumer cursor
    /// `cursor`. Returns None (and logs) if a corrupted cursor would escape
    /// the registered ring.
    pub(crate) fn server_region(&self, cursor: u32, frames: u32) -> Option<*mut i16> {
        self.region(cursor, self.server_base.load(Ordering::Relaxed), frames)
    }

    /// Bounds-checked pointer for the producer cursor. Refused for static
    /// clips, which are read-only.
    pub(crate) fn user_region(&self, cursor: u32, frames: u32) -> Option<*mut i16> {
        if matches!(self.storage, Storage::Static(_)) {
            return None;
        }
        self.region(cursor, self.user_base.load(Ordering::Relaxed), frames)
    }

    fn region(&self, cursor: u32, base: u32, frames: u32) -> Option<*mut i16> {
        let rel = cursor.wrapping_sub(base) as usize;
        let frames = frames as usize;
        let samples_per_frame = self.channels as usize;
        let start = rel.checked_mul(samples_per_frame)?;
        let len = frames.checked_mul(samples_per_frame)?;
        if rel + frames > self.frame_count as usize || start + len > self.storage.len() {
            tracing::error!(
                "control block region out of range: cursor {} base {} frames {} frame_count {}",
                cursor,
                base,
                frames,
                self.frame_count
            );
            return None;
        }
        let ptr = match &self.storage {
            Storage::Ring(cell) => unsafe { (*cell.get()).as_mut_ptr() },
            Storage::Static(data) => data.as_ptr() as *mut i16,
        };
        // SAFETY: start+len bounds-checked against the storage above.
        Some(unsafe { ptr.add(start) })
    }

    // ------------------------------------------------------------------
    // Client-side helpers: the thin handle layer uses these instead of a
    // remote AudioTrack/AudioRecord library.
    // ------------------------------------------------------------------

    /// Producer write for playback rings. Copies as many whole frames as
    /// fit and returns the number written; never blocks.
    pub fn write_frames(&self, pcm: &[i16]) -> usize {
        debug_assert!(self.out);
        let samples_per_frame = self.channels as usize;
        let total = pcm.len() / samples_per_frame;
        let mut written = 0usize;
        while written < total {
            let avail = self.frames_available();
            if avail == 0 {
                break;
            }
            let u = self.user.load(Ordering::Relaxed);
            let base = self.user_base.load(Ordering::Relaxed);
            let contig = self.frame_count - u.wrapping_sub(base).min(self.frame_count);
            let n = (total - written).min(avail as usize).min(contig as usize);
            if n == 0 {
                break;
            }
            let Some(dst) = self.user_region(u, n as u32) else {
                break;
            };
            let src = &pcm[written * samples_per_frame..][..n * samples_per_frame];
            // SAFETY: region is bounds-checked and disjoint from anything
            // the consumer is reading (cursor protocol).
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
            }
            self.step_user(n as u32);
            written += n;
        }
        written
    }

    /// Blocking producer write: waits on the control-block condvar (bounded
    /// by the canonical 1 s timeout per wait) whenever the ring is full.
    pub fn write_frames_blocking(&self, pcm: &[i16]) -> AudioResult<usize> {
        let samples_per_frame = self.channels as usize;
        let total = pcm.len() / samples_per_frame;
        let mut written = 0usize;
        while written < total {
            let n = self.write_frames(&pcm[written * samples_per_frame..]);
            written += n;
            if written >= total {
                break;
            }
            if n == 0 && !self.wait_for(|| self.frames_available() > 0) {
                if written == 0 {
                    return Err(AudioError::TimedOut);
                }
                break;
            }
        }
        Ok(written)
    }

    /// Consumer read for record rings. Copies as many whole frames as are
    /// ready and returns the number read; never blocks.
    pub fn read_frames(&self, out: &mut [i16]) -> usize {
        debug_assert!(!self.out);
        let samples_per_frame = self.channels as usize;
        let total = out.len() / samples_per_frame;
        let mut read = 0usize;
        while read < total {
            let ready = self.frames_ready();
            if ready == 0 {
                break;
            }
            let u = self.user.load(Ordering::Relaxed);
            let base = self.user_base.load(Ordering::Relaxed);
            let contig = self.frame_count - u.wrapping_sub(base).min(self.frame_count);
            let n = (total - read).min(ready as usize).min(contig as usize);
            if n == 0 {
                break;
            }
            let Some(src) = self.user_region(u, n as u32) else {
                break;
            };
            let dst = &mut out[read * samples_per_frame..][..n * samples_per_frame];
            // SAFETY: bounds-checked region owned by the consumer side until
            // step_user retires it.
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const i16, dst.as_mut_ptr(), dst.len());
            }
            self.step_user(n as u32);
            read += n;
        }
        read
    }

    /// Blocking consumer read for record rings.
    pub fn read_frames_blocking(&self, out: &mut [i16]) -> AudioResult<usize> {
        let samples_per_frame = self.channels as usize;
        let total = out.len() / samples_per_frame;
        let mut read = 0usize;
        while read < total {
            let n = self.read_frames(&mut out[read * samples_per_frame..]);
            read += n;
            if read >= total {
                break;
            }
            if n == 0 && !self.wait_for(|| self.frames_ready() > 0) {
                if read == 0 {
                    return Err(AudioError::TimedOut);
                }
                break;
            }
        }
        Ok(read)
    }

    /// Bounded wait for producer space; used by output tracks riding
    /// downstream backpressure. True if space appeared within `timeout`.
    pub(crate) fn wait_space(&self, timeout: std::time::Duration) -> bool {
        self.wait_with_timeout(timeout, || self.frames_available() > 0)
    }

    /// One bounded condvar wait for `cond`; true if the condition held
    /// before the timeout elapsed.
    fn wait_for(&self, cond: impl Fn() -> bool) -> bool {
        self.wait_with_timeout(CBLK_WAIT_TIMEOUT, cond)
    }

    fn wait_with_timeout(&self, timeout: std::time::Duration, cond: impl Fn() -> bool) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _res) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            guard = g;
        }
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("frame_count", &self.frame_count)
            .field("channels", &self.channels)
            .field("out", &self.out)
            .field("user", &self.user.load(Ordering::Relaxed))
            .field("server", &self.server.load(Ordering::Relaxed))
            .field("ready", &self.frames_ready())
            .finish()
    }
}
