// Pull contract for anything that can source PCM: tracks, record rings, and
// the record thread itself when it feeds the resampler.

use crate::audio::types::{AudioError, AudioResult};

/// A borrowed view into a provider's ring. `raw` stays valid until the
/// matching `release_buffer`; consumers must treat a failed pull as silence.
#[derive(Debug)]
pub struct AudioBuffer {
    pub raw: *mut i16,
    pub frame_count: usize,
}

impl AudioBuffer {
    pub const fn empty() -> Self {
        AudioBuffer {
            raw: std::ptr::null_mut(),
            frame_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_null() || self.frame_count == 0
    }

    pub fn clear(&mut self) {
        self.raw = std::ptr::null_mut();
        self.frame_count = 0;
    }

    /// View the buffer as samples. `samples_per_frame` is the provider's
    /// channel count.
    ///
    /// # Safety
    /// Only valid between a successful `get_next_buffer` and the matching
    /// `release_buffer` on the same provider.
    pub unsafe fn as_slice(&self, samples_per_frame: usize) -> &[i16] {
        std::slice::from_raw_parts(self.raw, self.frame_count * samples_per_frame)
    }

    /// Mutable view, for producers filling a ring region.
    ///
    /// # Safety
    /// Same contract as [`AudioBuffer::as_slice`].
    pub unsafe fn as_mut_slice(&mut self, samples_per_frame: usize) -> &mut [i16] {
        std::slice::from_raw_parts_mut(self.raw, self.frame_count * samples_per_frame)
    }
}

/// Pullable audio source. `get_next_buffer` treats `buffer.frame_count` as a
/// maximum and shrinks it to what is contiguously available; on
/// `NotEnoughData` the caller substitutes silence. `release_buffer` reports
/// how many frames were actually consumed and advances the provider cursor.
pub trait AudioBufferProvider: Send {
    fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()>;
    fn release_buffer(&mut self, buffer: &mut AudioBuffer);
}

/// Convenience pull that normalises every failure to an empty buffer.
pub(crate) fn pull(provider: &mut dyn AudioBufferProvider, buffer: &mut AudioBuffer, max: usize) {
    buffer.frame_count = max;
    match provider.get_next_buffer(buffer) {
        Ok(()) if !buffer.raw.is_null() => {}
        Ok(()) | Err(AudioError::NotEnoughData) => buffer.clear(),
        Err(_) => buffer.clear(),
    }
}
