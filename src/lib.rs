//! Streaming constant-Q spectrogram engine.
//!
//! Mono samples of any chunk size go in through [`Transformer::add_samples`]; a
//! logarithmically binned magnitude surface comes out as device-resident texture tiles
//! and a history texture array, computed by a convolution kernel on an injected
//! [`ComputeDevice`].

pub mod audio;
pub mod biquad;
pub mod config;
pub mod decimator;
pub mod device;
pub mod error;
pub mod transformer;
pub mod wavelet;

pub use audio::{Accumulator, AccumulatorEvent, AudioBuffer, ReadyBlock, RingBuffer};
pub use config::AnalyzerConfig;
pub use decimator::{Band, Decimator, FilterResponse};
pub use device::{BufferHandle, ComputeDevice, CpuDevice, TextureHandle};
pub use error::{AnalyzerError, Result};
pub use transformer::{RingPosition, SpectrogramInfo, Transformer};
pub use wavelet::{frame_count, Kernel, KernelBank, WaveletTransform};

#[cfg(feature = "gpu")]
pub use device::WgpuDevice;
