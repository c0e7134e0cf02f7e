// Incremental linear (order-1) resampler over the pull contract. Output is
// always interleaved stereo at the device rate; mono inputs are duplicated.
// The phase accumulator is a 32.32 fixed-point position so arbitrary rate
// ratios up to the 2x input limit track without drift.

use super::provider::{pull, AudioBuffer, AudioBufferProvider};

const FRAC_BITS: u32 = 32;
const FRAC_MASK: u64 = (1u64 << FRAC_BITS) - 1;
// interpolation precision
const INTERP_BITS: u32 = 15;

pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
    channels: u32,
    phase: u64,
    phase_inc: u64,
    prev: [i32; 2],
    cur: [i32; 2],
    primed: bool,
    held: AudioBuffer,
    held_index: usize,
}

// The held AudioBuffer is a raw view into the provider's ring; the resampler
// moves between control and mixing contexts only together with its provider.
unsafe impl Send for LinearResampler {}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: u32) -> Self {
        let mut r = LinearResampler {
            in_rate: in_rate.max(1),
            out_rate: out_rate.max(1),
            channels: channels.clamp(1, 2),
            phase: 0,
            phase_inc: 0,
            prev: [0; 2],
            cur: [0; 2],
            primed: false,
            held: AudioBuffer::empty(),
            held_index: 0,
        };
        r.update_increment();
        r
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn set_in_rate(&mut self, rate: u32) {
        if rate != self.in_rate && rate > 0 {
            self.in_rate = rate;
            self.update_increment();
        }
    }

    fn update_increment(&mut self) {
        self.phase_inc = ((self.in_rate as u64) << FRAC_BITS) / self.out_rate as u64;
    }

    /// Produce up to `out.len() / 2` stereo frames into `out`, pulling input
    /// from `provider` as needed. Returns the frames produced; the caller
    /// treats the remainder as silence. A buffer obtained from the provider
    /// may be held across calls until fully consumed.
    pub fn resample(
        &mut self,
        out: &mut [i16],
        provider: &mut dyn AudioBufferProvider,
    ) -> usize {
        let frames_out = out.len() / 2;
        let mut produced = 0usize;

        if !self.primed {
            match self.next_input_frame(provider, frames_out) {
                Some(f) => {
                    self.prev = f;
                    self.cur = self.next_input_frame(provider, frames_out).unwrap_or(f);
                    self.primed = true;
                }
                None => return 0,
            }
        }

        while produced < frames_out {
            // advance the input position by however many whole frames the
            // phase accumulator has crossed
            let mut advance = (self.phase >> FRAC_BITS) as usize;
            if advance > 0 {
                self.phase &= FRAC_MASK;
                while advance > 0 {
                    match self.next_input_frame(provider, frames_out - produced) {
                        Some(f) => {
                            self.prev = self.cur;
                            self.cur = f;
                        }
                        None => {
                            // starved: restore the un-consumed advance so the
                            // position stays honest for the next cycle
                            self.phase += (advance as u64) << FRAC_BITS;
                            return produced;
                        }
                    }
                    advance -= 1;
                }
            }

            let frac = ((self.phase >> (FRAC_BITS - INTERP_BITS)) & ((1 << INTERP_BITS) - 1)) as i32;
            let l = self.prev[0] + (((self.cur[0] - self.prev[0]) * frac) >> INTERP_BITS);
            let r = self.prev[1] + (((self.cur[1] - self.prev[1]) * frac) >> INTERP_BITS);
            out[produced * 2] = l as i16;
            out[produced * 2 + 1] = r as i16;
            produced += 1;
            self.phase += self.phase_inc;
        }
        produced
    }

    /// Next input frame as an L/R pair, pulling a fresh provider buffer when
    /// the held one is exhausted. `hint` sizes the pull request.
    fn next_input_frame(
        &mut self,
        provider: &mut dyn AudioBufferProvider,
        hint: usize,
    ) -> Option<[i32; 2]> {
        let ch = self.channels as usize;
        if self.held.is_empty() || self.held_index >= self.held.frame_count {
            if !self.held.is_empty() {
                provider.release_buffer(&mut self.held);
            }
            self.held_index = 0;
            let want = (hint * self.in_rate as usize / self.out_rate as usize + 2).max(1);
            pull(provider, &mut self.held, want);
            if self.held.is_empty() {
                return None;
            }
        }
        // SAFETY: held is a live provider buffer until release_buffer.
        let samples = unsafe { self.held.as_slice(ch) };
        let idx = self.held_index * ch;
        let frame = if ch == 1 {
            [samples[idx] as i32, samples[idx] as i32]
        } else {
            [samples[idx] as i32, samples[idx + 1] as i32]
        };
        self.held_index += 1;
        Some(frame)
    }

    /// Forget any held input; used when the source is rebound.
    pub fn reset(&mut self, provider: Option<&mut dyn AudioBufferProvider>) {
        if let Some(p) = provider {
            if !self.held.is_empty() {
                p.release_buffer(&mut self.held);
            }
        }
        self.held.clear();
        self.held_index = 0;
        self.phase = 0;
        self.primed = false;
        self.prev = [0; 2];
        self.cur = [0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::{AudioError, AudioResult};

    /// Provider over an owned mono/stereo sample vector.
    struct VecProvider {
        data: Vec<i16>,
        channels: usize,
        pos: usize,
    }

    impl AudioBufferProvider for VecProvider {
        fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()> {
            let frames_left = self.data.len() / self.channels - self.pos;
            if frames_left == 0 {
                buffer.clear();
                return Err(AudioError::NotEnoughData);
            }
            let n = buffer.frame_count.min(frames_left);
            buffer.raw = self.data[self.pos * self.channels..].as_mut_ptr();
            buffer.frame_count = n;
            Ok(())
        }

        fn release_buffer(&mut self, buffer: &mut AudioBuffer) {
            self.pos += buffer.frame_count;
            buffer.clear();
        }
    }

    #[test]
    fn unity_ratio_passes_samples_through() {
        let mut rs = LinearResampler::new(48000, 48000, 2);
        let data: Vec<i16> = (0..200).map(|i| (i * 50) as i16).collect();
        let mut provider = VecProvider {
            data: data.clone(),
            channels: 2,
            pos: 0,
        };
        let mut out = vec![0i16; 120];
        let produced = rs.resample(&mut out, &mut provider);
        assert_eq!(produced, 60);
        // phase 0 with unity increment reproduces the input exactly
        assert_eq!(&out[..8], &data[..8]);
    }

    #[test]
    fn upsampling_doubles_frame_count() {
        let mut rs = LinearResampler::new(22050, 44100, 1);
        let data: Vec<i16> = vec![1000; 300];
        let mut provider = VecProvider {
            data,
            channels: 1,
            pos: 0,
        };
        let mut out = vec![0i16; 400];
        let produced = rs.resample(&mut out, &mut provider);
        assert_eq!(produced, 200);
        // constant input stays constant through interpolation, duplicated
        // onto both channels
        assert!(out[..400].iter().all(|&s| s == 1000));
    }

    #[test]
    fn starvation_returns_short_count() {
        let mut rs = LinearResampler::new(44100, 44100, 2);
        let mut provider = VecProvider {
            data: vec![7; 20],
            channels: 2,
            pos: 0,
        };
        let mut out = vec![0i16; 256];
        let produced = rs.resample(&mut out, &mut provider);
        assert!(produced <= 10);
        assert!(produced >= 8);
    }
}
