// Virtual track used by a duplicating endpoint to feed a downstream mixer.
// The duplicating loop writes mixed blocks in; the destination mixer pulls
// them out like any client track. A bounded overflow queue rides out
// downstream backpressure; beyond it, audio is dropped with a warning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::audio::threads::playback::PlaybackThread;
use crate::audio::types::MAX_OVERFLOW_BUFFERS;

use super::playback::Track;

/// Retry budget for a bridge track; generous because the source cadence is
/// another mixer, not a client.
const OUTPUT_TRACK_RETRIES: i32 = 127;

struct PendingBuffer {
    data: Vec<i16>,
    /// samples already written downstream
    offset: usize,
}

impl PendingBuffer {
    fn silence(samples: usize) -> Self {
        PendingBuffer {
            data: vec![0i16; samples],
            offset: 0,
        }
    }

    fn from_samples(samples: &[i16]) -> Self {
        PendingBuffer {
            data: samples.to_vec(),
            offset: 0,
        }
    }
}

pub(crate) struct OutputTrack {
    track: Arc<Track>,
    active: AtomicBool,
    queue: Mutex<VecDeque<PendingBuffer>>,
    wait_time: Duration,
}

impl Drop for OutputTrack {
    fn drop(&mut self) {
        // detach the bridge track so the destination thread releases its
        // slot and list entry
        self.track.destroy();
    }
}

impl OutputTrack {
    pub fn new(track: Arc<Track>, wait_time: Duration) -> Arc<OutputTrack> {
        Arc::new(OutputTrack {
            track,
            active: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            wait_time,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn feeds(&self, thread: &Arc<PlaybackThread>) -> bool {
        self.track
            .upgrade_thread()
            .map(|t| Arc::ptr_eq(&t, thread))
            .unwrap_or(false)
    }

    fn start(&self) {
        if let Err(e) = self.track.start() {
            warn!("output track start failed: {e}");
            return;
        }
        self.track
            .retry_count
            .store(OUTPUT_TRACK_RETRIES, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Stop the bridge and drop anything still queued. Takes the
    /// destination thread's lock; callers must not hold the duplicating
    /// thread's own lock.
    pub fn stop(&self) {
        self.track.stop();
        self.queue.lock().unwrap().clear();
        self.active.store(false, Ordering::Release);
    }

    /// Push one mixed block downstream. `frames == 0` is the drain call:
    /// flush queued overflow and, once drained, either front-fill the ring
    /// so the destination mixer starts, or stop the bridge.
    ///
    /// Returns true when the destination ring stayed full past the wait
    /// budget.
    pub fn write(&self, data: &[i16], frames: usize) -> bool {
        let cblk = &self.track.cblk;
        let channels = cblk.channel_count() as usize;
        let mut output_full = false;
        let deadline = Instant::now() + self.wait_time;

        if !self.is_active() {
            self.start();
            // prime with silence up to one destination buffer so the
            // downstream mixer does not underrun on its first pull
            let frame_count = cblk.frame_count() as usize;
            if frame_count > frames {
                let mut queue = self.queue.lock().unwrap();
                if queue.len() < MAX_OVERFLOW_BUFFERS {
                    queue.push_back(PendingBuffer::silence((frame_count - frames) * channels));
                } else {
                    warn!("output track: no room to prime, queue full");
                }
            }
        }

        let total_in = frames * channels;
        let mut in_pos = 0usize;

        loop {
            // queued overflow drains before new data; the queue lock is
            // released before any wait
            let wrote;
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(front) = queue.front_mut() {
                    let w = cblk.write_frames(&front.data[front.offset..]);
                    front.offset += w * channels;
                    if front.offset >= front.data.len() {
                        queue.pop_front();
                        debug!("output track released overflow buffer ({} left)", queue.len());
                        continue;
                    }
                    wrote = w;
                } else {
                    drop(queue);
                    if in_pos >= total_in {
                        break;
                    }
                    let w = cblk.write_frames(&data[in_pos..total_in]);
                    in_pos += w * channels;
                    if in_pos >= total_in {
                        break;
                    }
                    wrote = w;
                }
            }

            if wrote == 0 {
                let now = Instant::now();
                if !self.is_active() || now >= deadline {
                    output_full = true;
                    break;
                }
                if !cblk.wait_space(deadline - now) {
                    output_full = true;
                    break;
                }
            }
        }

        // anything we could not place gets queued for the next cycle
        if in_pos < total_in {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() < MAX_OVERFLOW_BUFFERS {
                queue.push_back(PendingBuffer::from_samples(&data[in_pos..total_in]));
                debug!("output track queued overflow ({} pending)", queue.len());
            } else {
                warn!("output track: overflow dropped, no more buffers");
            }
        }

        if frames == 0 && self.queue.lock().unwrap().is_empty() {
            let user = cblk.user();
            let frame_count = cblk.frame_count();
            if user < frame_count {
                // never filled a whole buffer: pad so the destination mixer
                // actually starts this track
                let pad = (frame_count - user) as usize * channels;
                self.queue
                    .lock()
                    .unwrap()
                    .push_back(PendingBuffer::silence(pad));
            } else {
                self.stop();
            }
        }

        output_full
    }
}
