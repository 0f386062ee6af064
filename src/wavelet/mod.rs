//! Constant-Q kernels and their convolution on a compute device.

mod kernel;
mod transform;

pub use kernel::{kernel_length, Kernel, KernelBank, MAX_KERNEL_LENGTH, MIN_KERNEL_LENGTH};
pub use transform::{frame_count, WaveletTransform};
