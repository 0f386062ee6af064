//! Compute device abstraction.
//!
//! The pipeline never acquires a device itself: callers construct one (host memory or
//! wgpu) at an outer scope and inject it as `Arc<dyn ComputeDevice>`. Resources are
//! addressed through opaque handles so backends can keep their own resource tables.
//!
//! Enqueue operations (`write_buffer`, `copy_buffer_to_texture`, `dispatch_convolution`)
//! return immediately and execute in submission order. Readbacks (`read_buffer`,
//! `read_texture`) and `synchronize` block until the device has finished all work
//! submitted before them.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;

use bytemuck::{Pod, Zeroable};

pub use cpu::CpuDevice;
#[cfg(feature = "gpu")]
pub use gpu::WgpuDevice;

use crate::error::{AnalyzerError, Result};

/// WGSL source of the convolution kernel shared by the GPU backend.
pub const CQT_SHADER: &str = include_str!("cqt.wgsl");

/// Invocations per workgroup along the bin axis; must match `cqt.wgsl`.
pub const WORKGROUP_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Shape of a single-channel `f32` texture; `layers > 1` makes it an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureShape {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl TextureShape {
    pub fn layer_texels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Rows of one texture layer targeted by a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub layer: u32,
    pub row: u32,
    pub rows: u32,
}

/// Location of one bin's kernel inside the packed kernel buffer: `length` real
/// coefficients at `offset`, followed by `length` imaginary coefficients.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelInfo {
    pub offset: u32,
    pub length: u32,
}

/// Uniform block of one convolution dispatch; layout matches `Params` in `cqt.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ConvolutionParams {
    pub input_offset: u32,
    pub output_offset: u32,
    pub num_frames: u32,
    pub num_bins: u32,
    pub hop_length: u32,
    pub input_length: u32,
    pub _pad: [u32; 2],
}

/// Buffers bound to one convolution dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvolutionBindings {
    pub input: BufferHandle,
    pub kernels: BufferHandle,
    pub kernel_info: BufferHandle,
    pub output: BufferHandle,
}

/// A device capable of holding buffers and textures and running the CQT convolution.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Allocates a zero-initialised storage buffer of `size` bytes.
    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle>;
    /// Enqueues a host-to-device write. `offset` and `data.len()` must be multiples of 4.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn clear_buffer(&self, buffer: BufferHandle) -> Result<()>;
    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()>;

    fn create_texture(&self, label: &str, shape: TextureShape) -> Result<TextureHandle>;
    /// Enqueues a copy of `region.rows` tightly packed rows starting at byte `offset`.
    fn copy_buffer_to_texture(
        &self,
        source: BufferHandle,
        offset: u64,
        texture: TextureHandle,
        region: TextureRegion,
    ) -> Result<()>;
    fn destroy_texture(&self, texture: TextureHandle) -> Result<()>;

    /// Enqueues one invocation per `(bin, frame)`: the bin's kernel is correlated with
    /// `input[input_offset + frame * hop_length ..]` and the magnitude is stored at
    /// `output[(output_offset + frame) * num_bins + bin]`. Frames whose window would
    /// read past `input_length` leave their output untouched.
    fn dispatch_convolution(
        &self,
        bindings: &ConvolutionBindings,
        params: &ConvolutionParams,
    ) -> Result<()>;

    /// Waits for prior work, then copies `size` bytes at `offset` back to the host.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>>;
    /// Waits for prior work, then returns one layer, rows tightly packed.
    fn read_texture(&self, texture: TextureHandle, layer: u32) -> Result<Vec<u8>>;
    /// Blocks until every submitted operation has completed.
    fn synchronize(&self) -> Result<()>;

    /// True once the device has been lost; all resources are then invalid.
    fn is_lost(&self) -> bool;
}

/// Fails with `DeviceLost` when the device can no longer be used.
pub fn ensure_alive(device: &dyn ComputeDevice) -> Result<()> {
    if device.is_lost() {
        log::error!("compute device '{}' was lost", device.name());
        return Err(AnalyzerError::DeviceLost(device.name().to_string()));
    }
    Ok(())
}

/// Writes `samples` starting at sample index `offset`.
pub fn write_samples(
    device: &dyn ComputeDevice,
    buffer: BufferHandle,
    offset: usize,
    samples: &[f32],
) -> Result<()> {
    device.write_buffer(buffer, byte_len(offset), bytemuck::cast_slice(samples))
}

/// Reads `count` samples starting at sample index `offset`.
pub fn read_samples(
    device: &dyn ComputeDevice,
    buffer: BufferHandle,
    offset: usize,
    count: usize,
) -> Result<Vec<f32>> {
    let bytes = device.read_buffer(buffer, byte_len(offset), byte_len(count))?;
    Ok(samples_from_bytes(&bytes))
}

/// Reinterprets native-endian bytes as samples without requiring alignment.
pub fn samples_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Size in bytes of `count` `f32` values.
pub fn byte_len(count: usize) -> u64 {
    (count * std::mem::size_of::<f32>()) as u64
}
