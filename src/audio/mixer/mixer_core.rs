// Software mix pipeline for one output endpoint: a fixed set of track
// slots, each with its own format/rate/volume programming, summed into an
// i32 accumulator and clamped to one interleaved stereo 16-bit block per
// `process` call. Never blocks on I/O: a provider that comes up short
// contributes silence for the rest of the cycle.

use tracing::warn;

use super::provider::{pull, AudioBuffer, AudioBufferProvider};
use super::resampler::LinearResampler;
use crate::audio::types::{SampleFormat, MAX_MIXER_TRACKS};

// Volume is Q4.12; ramps run in Q4.12 left-shifted 16 for per-frame
// precision.
const VOLUME_SHIFT: u32 = 12;
const RAMP_SHIFT: u32 = 16;

struct MixerSlot {
    in_use: bool,
    enabled: bool,
    source_id: usize,
    provider: Option<Box<dyn AudioBufferProvider>>,
    sample_rate: u32,
    channels: u32,
    resampler: Option<LinearResampler>,
    vol: [i64; 2],
    target: [u16; 2],
}

impl MixerSlot {
    fn idle() -> Self {
        MixerSlot {
            in_use: false,
            enabled: false,
            source_id: 0,
            provider: None,
            sample_rate: 0,
            channels: 2,
            resampler: None,
            vol: [0; 2],
            target: [0; 2],
        }
    }
}

pub(crate) struct SampleMixer {
    frame_count: usize,
    sample_rate: u32,
    slots: Vec<MixerSlot>,
    accum: Vec<i32>,
    scratch: Vec<i16>,
}

impl SampleMixer {
    pub fn new(frame_count: usize, sample_rate: u32) -> Self {
        SampleMixer {
            frame_count,
            sample_rate,
            slots: (0..MAX_MIXER_TRACKS).map(|_| MixerSlot::idle()).collect(),
            accum: vec![0; frame_count * 2],
            scratch: vec![0; frame_count * 2],
        }
    }

    /// Rebuild after an output reconfiguration. All slot programming is
    /// refreshed by the next prepare pass.
    pub fn reconfigure(&mut self, frame_count: usize, sample_rate: u32) {
        self.frame_count = frame_count;
        self.sample_rate = sample_rate;
        self.accum = vec![0; frame_count * 2];
        self.scratch = vec![0; frame_count * 2];
        for slot in &mut self.slots {
            slot.resampler = None;
            slot.sample_rate = 0;
        }
    }

    /// Bind a slot to a source, replacing the provider when the source
    /// changed (track migration reuses slot names for new tracks).
    pub fn set_provider(
        &mut self,
        name: usize,
        source_id: usize,
        provider: Box<dyn AudioBufferProvider>,
    ) {
        let slot = &mut self.slots[name];
        if !slot.in_use || slot.source_id != source_id {
            slot.in_use = true;
            slot.source_id = source_id;
            slot.provider = Some(provider);
            if let Some(rs) = slot.resampler.as_mut() {
                rs.reset(None);
            }
        }
    }

    pub fn enable(&mut self, name: usize) {
        self.slots[name].enabled = true;
    }

    pub fn disable(&mut self, name: usize) {
        self.slots[name].enabled = false;
    }

    /// Free a slot entirely; the name may be handed to another track.
    pub fn release(&mut self, name: usize) {
        if name < self.slots.len() {
            self.slots[name] = MixerSlot::idle();
        }
    }

    pub fn set_format(&mut self, name: usize, format: SampleFormat, channels: u32) {
        if !format.is_linear_pcm() {
            warn!("mixer slot {} asked for a non-PCM format", name);
        }
        let slot = &mut self.slots[name];
        let channels = channels.clamp(1, 2);
        if slot.channels != channels {
            slot.channels = channels;
            slot.resampler = None;
            slot.sample_rate = 0;
        }
    }

    /// Program the input rate; a resampler appears or retunes when it
    /// differs from the device rate.
    pub fn set_input_rate(&mut self, name: usize, rate: u32) {
        let device_rate = self.sample_rate;
        let slot = &mut self.slots[name];
        if slot.sample_rate == rate {
            return;
        }
        slot.sample_rate = rate;
        if rate == device_rate {
            slot.resampler = None;
        } else {
            match slot.resampler.as_mut() {
                Some(rs) => rs.set_in_rate(rate),
                None => slot.resampler = Some(LinearResampler::new(rate, device_rate, slot.channels)),
            }
        }
    }

    /// Program left/right gain (Q4.12). Without `ramp` the gain applies
    /// from the first frame of the next block; with it, the gain slews
    /// across the block to avoid zipper noise.
    pub fn set_volume(&mut self, name: usize, left: u16, right: u16, ramp: bool) {
        let slot = &mut self.slots[name];
        slot.target = [left, right];
        if !ramp {
            slot.vol = [(left as i64) << RAMP_SHIFT, (right as i64) << RAMP_SHIFT];
        }
    }

    /// Mix one block: pulls every enabled slot, resamples, scales, sums and
    /// clamps into exactly `frame_count` interleaved stereo frames.
    pub fn process(&mut self, out: &mut [i16]) {
        debug_assert_eq!(out.len(), self.frame_count * 2);
        self.accum.fill(0);

        for slot in self.slots.iter_mut() {
            if !slot.enabled || slot.provider.is_none() {
                continue;
            }
            self.scratch.fill(0);
            let provider = slot.provider.as_mut().expect("checked above").as_mut();
            let produced = match slot.resampler.as_mut() {
                Some(rs) => rs.resample(&mut self.scratch, provider),
                None => direct_pull(provider, &mut self.scratch, slot.channels),
            };
            if produced == 0 {
                continue;
            }

            // per-frame ramped accumulate; products are Q4.12 and the final
            // clamp shifts them back out
            let frames = self.frame_count;
            for ch in 0..2 {
                let target = (slot.target[ch] as i64) << RAMP_SHIFT;
                let inc = (target - slot.vol[ch]) / frames as i64;
                let mut vol = slot.vol[ch];
                for frame in 0..produced {
                    let gain = (vol >> RAMP_SHIFT) as i32;
                    self.accum[frame * 2 + ch] += self.scratch[frame * 2 + ch] as i32 * gain;
                    vol += inc;
                }
                slot.vol[ch] = target;
            }
        }

        dither_and_clamp(&self.accum, out);
    }
}

/// Pull up to `frame_count` stereo frames at the device rate straight from
/// the provider, duplicating mono onto both channels.
fn direct_pull(provider: &mut dyn AudioBufferProvider, scratch: &mut [i16], channels: u32) -> usize {
    let frames_wanted = scratch.len() / 2;
    let ch = channels.clamp(1, 2) as usize;
    let mut filled = 0usize;
    let mut buffer = AudioBuffer::empty();
    while filled < frames_wanted {
        pull(provider, &mut buffer, frames_wanted - filled);
        if buffer.is_empty() {
            break;
        }
        // SAFETY: live provider buffer until release_buffer below.
        let samples = unsafe { buffer.as_slice(ch) };
        for f in 0..buffer.frame_count {
            let (l, r) = if ch == 1 {
                (samples[f], samples[f])
            } else {
                (samples[f * 2], samples[f * 2 + 1])
            };
            scratch[(filled + f) * 2] = l;
            scratch[(filled + f) * 2 + 1] = r;
        }
        filled += buffer.frame_count;
        provider.release_buffer(&mut buffer);
    }
    filled
}

/// Collapse the Q4.12 accumulator into 16-bit output with saturation.
fn dither_and_clamp(accum: &[i32], out: &mut [i16]) {
    for (acc, o) in accum.iter().zip(out.iter_mut()) {
        *o = (acc >> VOLUME_SHIFT).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Allocate a free mixer name out of a 32-bit slot mask. Kept next to the
/// mixer because the mask and the slot table must agree.
pub(crate) fn allocate_name(mask: &mut u32) -> Option<usize> {
    for name in 0..MAX_MIXER_TRACKS {
        if *mask & (1 << name) == 0 {
            *mask |= 1 << name;
            return Some(name);
        }
    }
    warn!("no more mixer track names available");
    None
}

pub(crate) fn free_name(mask: &mut u32, name: usize) {
    if name < MAX_MIXER_TRACKS {
        *mask &= !(1 << name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::{AudioError, AudioResult, UNITY_GAIN};

    struct ConstProvider {
        value: i16,
        frames_left: usize,
        store: Vec<i16>,
        channels: usize,
    }

    impl ConstProvider {
        fn new(value: i16, frames: usize, channels: usize) -> Self {
            ConstProvider {
                value,
                frames_left: frames,
                store: Vec::new(),
                channels,
            }
        }
    }

    impl AudioBufferProvider for ConstProvider {
        fn get_next_buffer(&mut self, buffer: &mut AudioBuffer) -> AudioResult<()> {
            if self.frames_left == 0 {
                buffer.clear();
                return Err(AudioError::NotEnoughData);
            }
            let n = buffer.frame_count.min(self.frames_left);
            self.store = vec![self.value; n * self.channels];
            buffer.raw = self.store.as_mut_ptr();
            buffer.frame_count = n;
            Ok(())
        }

        fn release_buffer(&mut self, buffer: &mut AudioBuffer) {
            self.frames_left -= buffer.frame_count;
            buffer.clear();
        }
    }

    #[test]
    fn two_tracks_sum_and_clamp() {
        let mut mixer = SampleMixer::new(64, 48000);
        for name in 0..2 {
            mixer.set_provider(name, name + 1, Box::new(ConstProvider::new(20000, 1024, 2)));
            mixer.set_format(name, SampleFormat::Pcm16, 2);
            mixer.set_input_rate(name, 48000);
            mixer.set_volume(name, UNITY_GAIN, UNITY_GAIN, false);
            mixer.enable(name);
        }
        let mut out = vec![0i16; 128];
        mixer.process(&mut out);
        // 20000 + 20000 saturates
        assert!(out.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn short_provider_leaves_silence_tail() {
        let mut mixer = SampleMixer::new(64, 48000);
        mixer.set_provider(0, 1, Box::new(ConstProvider::new(1000, 16, 2)));
        mixer.set_format(0, SampleFormat::Pcm16, 2);
        mixer.set_input_rate(0, 48000);
        mixer.set_volume(0, UNITY_GAIN, UNITY_GAIN, false);
        mixer.enable(0);
        let mut out = vec![0i16; 128];
        mixer.process(&mut out);
        assert!(out[..32].iter().all(|&s| s == 1000));
        assert!(out[32..].iter().all(|&s| s == 0));
    }

    #[test]
    fn mono_input_is_duplicated_to_stereo() {
        let mut mixer = SampleMixer::new(32, 44100);
        mixer.set_provider(0, 1, Box::new(ConstProvider::new(500, 256, 1)));
        mixer.set_format(0, SampleFormat::Pcm16, 1);
        mixer.set_input_rate(0, 44100);
        mixer.set_volume(0, UNITY_GAIN, UNITY_GAIN, false);
        mixer.enable(0);
        let mut out = vec![0i16; 64];
        mixer.process(&mut out);
        for frame in out.chunks(2) {
            assert_eq!(frame[0], frame[1]);
            assert_eq!(frame[0], 500);
        }
    }

    #[test]
    fn ramped_volume_slews_across_block() {
        let mut mixer = SampleMixer::new(64, 48000);
        mixer.set_provider(0, 1, Box::new(ConstProvider::new(10000, 1024, 2)));
        mixer.set_format(0, SampleFormat::Pcm16, 2);
        mixer.set_input_rate(0, 48000);
        // start silent, ramp to unity
        mixer.set_volume(0, 0, 0, false);
        mixer.set_volume(0, UNITY_GAIN, UNITY_GAIN, true);
        mixer.enable(0);
        let mut out = vec![0i16; 128];
        mixer.process(&mut out);
        assert!(out[0].abs() < 400);
        assert!(out[126] > 9000);
        // monotone-ish rise
        assert!(out[0] <= out[64] && out[64] <= out[126] + 200);
    }

    #[test]
    fn name_mask_allocates_and_frees() {
        let mut mask = 0u32;
        let a = allocate_name(&mut mask).unwrap();
        let b = allocate_name(&mut mask).unwrap();
        assert_ne!(a, b);
        free_name(&mut mask, a);
        assert_eq!(allocate_name(&mut mask), Some(a));
    }
}
