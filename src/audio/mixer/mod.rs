// Mix pipeline: pull contract, incremental resampler, and the per-endpoint
// software mixer.

pub mod provider;
pub mod resampler;

pub(crate) mod mixer_core;

pub use provider::{AudioBuffer, AudioBufferProvider};
pub use resampler::LinearResampler;

pub(crate) use mixer_core::{allocate_name, free_name, SampleMixer};
