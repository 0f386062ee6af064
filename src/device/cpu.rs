use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use super::{
    BufferHandle, ComputeDevice, ConvolutionBindings, ConvolutionParams, KernelInfo,
    TextureHandle, TextureRegion, TextureShape,
};
use crate::error::{AnalyzerError, Result};

struct CpuTexture {
    shape: TextureShape,
    texels: Vec<f32>,
}

#[derive(Default)]
struct Resources {
    // Buffers hold 32-bit words so they can be viewed as f32 or KernelInfo in place.
    buffers: FxHashMap<u64, Vec<u32>>,
    textures: FxHashMap<u64, CpuTexture>,
}

/// Host-memory implementation of [`ComputeDevice`].
///
/// Operations execute eagerly, so every enqueue is already complete when it returns.
/// It runs the same convolution as `cqt.wgsl` and is used as the reference backend
/// and as the fallback when no adapter is available.
pub struct CpuDevice {
    resources: Mutex<Resources>,
    next_id: AtomicU64,
    lost: AtomicBool,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Resources::default()),
            next_id: AtomicU64::new(1),
            lost: AtomicBool::new(false),
        }
    }

    /// Marks the device as lost, as a driver reset would.
    pub fn simulate_loss(&self) {
        log::warn!("cpu device marked as lost");
        self.lost.store(true, Ordering::SeqCst);
    }

    /// Number of live buffers and textures.
    pub fn resource_count(&self) -> (usize, usize) {
        match self.resources.lock() {
            Ok(resources) => (resources.buffers.len(), resources.textures.len()),
            Err(_) => (0, 0),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Resources>> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(AnalyzerError::DeviceLost(self.name().to_string()));
        }
        self.resources
            .lock()
            .map_err(|_| AnalyzerError::Device("cpu device resource table poisoned".into()))
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn word_range(what: &'static str, offset: u64, size: u64, capacity: usize) -> Result<(usize, usize)> {
    if offset % 4 != 0 || size % 4 != 0 {
        return Err(AnalyzerError::Device(format!(
            "{what}: offset {offset} and size {size} must be multiples of 4"
        )));
    }
    let start = (offset / 4) as usize;
    let end = start + (size / 4) as usize;
    if end > capacity {
        return Err(AnalyzerError::OutOfRange {
            what,
            offset: start,
            end,
            capacity,
        });
    }
    Ok((start, end))
}

fn unknown_buffer(handle: BufferHandle) -> AnalyzerError {
    AnalyzerError::UnknownResource(format!("buffer {}", handle.0))
}

fn unknown_texture(handle: TextureHandle) -> AnalyzerError {
    AnalyzerError::UnknownResource(format!("texture {}", handle.0))
}

/// Magnitude of the correlation between one kernel and the input at `start`.
#[inline]
fn correlate(input: &[f32], start: usize, kernel_re: &[f32], kernel_im: &[f32]) -> f32 {
    let window = &input[start..start + kernel_re.len()];
    let mut re = 0.0f32;
    let mut im = 0.0f32;
    for ((x, kr), ki) in window.iter().zip(kernel_re).zip(kernel_im) {
        re += x * kr;
        im += x * ki;
    }
    (re * re + im * im).sqrt()
}

fn convolve(
    input: &[f32],
    kernels: &[f32],
    info: &[KernelInfo],
    output: &mut [f32],
    params: &ConvolutionParams,
) -> Result<()> {
    let num_bins = params.num_bins as usize;
    if info.len() < num_bins {
        return Err(AnalyzerError::Device(format!(
            "kernel table holds {} entries, dispatch needs {}",
            info.len(),
            num_bins
        )));
    }
    let input_length = (params.input_length as usize).min(input.len());

    for frame in 0..params.num_frames as usize {
        let start = params.input_offset as usize + frame * params.hop_length as usize;
        let row = (params.output_offset as usize + frame) * num_bins;
        if row + num_bins > output.len() {
            return Err(AnalyzerError::OutOfRange {
                what: "convolution output",
                offset: row,
                end: row + num_bins,
                capacity: output.len(),
            });
        }
        for (bin, entry) in info.iter().take(num_bins).enumerate() {
            let offset = entry.offset as usize;
            let length = entry.length as usize;
            if start + length > input_length {
                continue;
            }
            if offset + 2 * length > kernels.len() {
                return Err(AnalyzerError::OutOfRange {
                    what: "kernel coefficients",
                    offset,
                    end: offset + 2 * length,
                    capacity: kernels.len(),
                });
            }
            let kernel_re = &kernels[offset..offset + length];
            let kernel_im = &kernels[offset + length..offset + 2 * length];
            output[row + bin] = correlate(input, start, kernel_re, kernel_im);
        }
    }
    Ok(())
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle> {
        let words = size.div_ceil(4) as usize;
        let id = self.allocate_id();
        self.lock()?.buffers.insert(id, vec![0; words]);
        log::trace!("cpu: created buffer '{}' ({} bytes) as {}", label, size, id);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut resources = self.lock()?;
        let words = resources
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| unknown_buffer(buffer))?;
        let (start, end) = word_range("buffer write", offset, data.len() as u64, words.len())?;
        for (word, chunk) in words[start..end].iter_mut().zip(data.chunks_exact(4)) {
            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn clear_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let mut resources = self.lock()?;
        let words = resources
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| unknown_buffer(buffer))?;
        words.fill(0);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.lock()?
            .buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| unknown_buffer(buffer))
    }

    fn create_texture(&self, label: &str, shape: TextureShape) -> Result<TextureHandle> {
        if shape.width == 0 || shape.height == 0 || shape.layers == 0 {
            return Err(AnalyzerError::Device(format!(
                "texture '{label}' has an empty extent {shape:?}"
            )));
        }
        let id = self.allocate_id();
        let texels = vec![0.0; shape.layer_texels() * shape.layers as usize];
        self.lock()?.textures.insert(id, CpuTexture { shape, texels });
        log::trace!("cpu: created texture '{}' {:?} as {}", label, shape, id);
        Ok(TextureHandle(id))
    }

    fn copy_buffer_to_texture(
        &self,
        source: BufferHandle,
        offset: u64,
        texture: TextureHandle,
        region: TextureRegion,
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let resources = &mut *guard;
        let words = resources
            .buffers
            .get(&source.0)
            .ok_or_else(|| unknown_buffer(source))?;
        let target = resources
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;

        let shape = target.shape;
        if region.layer >= shape.layers || region.row + region.rows > shape.height {
            return Err(AnalyzerError::OutOfRange {
                what: "texture copy",
                offset: region.row as usize,
                end: (region.row + region.rows) as usize,
                capacity: shape.height as usize,
            });
        }
        let texels = region.rows as usize * shape.width as usize;
        let (start, end) = word_range("texture copy source", offset, (texels * 4) as u64, words.len())?;

        let layer_base = region.layer as usize * shape.layer_texels();
        let dst_start = layer_base + region.row as usize * shape.width as usize;
        for (texel, word) in target.texels[dst_start..dst_start + texels]
            .iter_mut()
            .zip(&words[start..end])
        {
            *texel = f32::from_bits(*word);
        }
        Ok(())
    }

    fn destroy_texture(&self, texture: TextureHandle) -> Result<()> {
        self.lock()?
            .textures
            .remove(&texture.0)
            .map(|_| ())
            .ok_or_else(|| unknown_texture(texture))
    }

    fn dispatch_convolution(
        &self,
        bindings: &ConvolutionBindings,
        params: &ConvolutionParams,
    ) -> Result<()> {
        let output_id = bindings.output;
        if [bindings.input, bindings.kernels, bindings.kernel_info].contains(&output_id) {
            return Err(AnalyzerError::Device(
                "convolution output aliases one of its inputs".into(),
            ));
        }

        let mut resources = self.lock()?;
        // Take the output out of the table so the inputs can be borrowed alongside it.
        let mut output = resources
            .buffers
            .remove(&output_id.0)
            .ok_or_else(|| unknown_buffer(output_id))?;

        let result = (|| {
            let input = resources
                .buffers
                .get(&bindings.input.0)
                .ok_or_else(|| unknown_buffer(bindings.input))?;
            let kernels = resources
                .buffers
                .get(&bindings.kernels.0)
                .ok_or_else(|| unknown_buffer(bindings.kernels))?;
            let info_words = resources
                .buffers
                .get(&bindings.kernel_info.0)
                .ok_or_else(|| unknown_buffer(bindings.kernel_info))?;
            let info: &[KernelInfo] = bytemuck::try_cast_slice(info_words.as_slice())
                .map_err(|e| AnalyzerError::Device(format!("kernel table: {e}")))?;

            convolve(
                bytemuck::cast_slice(input.as_slice()),
                bytemuck::cast_slice(kernels.as_slice()),
                info,
                bytemuck::cast_slice_mut(output.as_mut_slice()),
                params,
            )
        })();

        resources.buffers.insert(output_id.0, output);
        result
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let resources = self.lock()?;
        let words = resources
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| unknown_buffer(buffer))?;
        let (start, end) = word_range("buffer read", offset, size, words.len())?;
        Ok(bytemuck::cast_slice(&words[start..end]).to_vec())
    }

    fn read_texture(&self, texture: TextureHandle, layer: u32) -> Result<Vec<u8>> {
        let resources = self.lock()?;
        let source = resources
            .textures
            .get(&texture.0)
            .ok_or_else(|| unknown_texture(texture))?;
        if layer >= source.shape.layers {
            return Err(AnalyzerError::OutOfRange {
                what: "texture layer",
                offset: layer as usize,
                end: layer as usize + 1,
                capacity: source.shape.layers as usize,
            });
        }
        let texels = source.shape.layer_texels();
        let start = layer as usize * texels;
        Ok(bytemuck::cast_slice(&source.texels[start..start + texels]).to_vec())
    }

    fn synchronize(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{read_samples, samples_from_bytes, write_samples};

    #[test]
    fn test_buffer_write_read() {
        let device = CpuDevice::new();
        let buffer = device.create_buffer("test", 64).unwrap();
        write_samples(&device, buffer, 4, &[1.0, 2.0, 3.0]).unwrap();
        let samples = read_samples(&device, buffer, 3, 5).unwrap();
        assert_eq!(samples, vec![0.0, 1.0, 2.0, 3.0, 0.0]);

        device.clear_buffer(buffer).unwrap();
        assert!(read_samples(&device, buffer, 0, 16).unwrap().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_out_of_range_write_rejected() {
        let device = CpuDevice::new();
        let buffer = device.create_buffer("small", 8).unwrap();
        let result = write_samples(&device, buffer, 1, &[1.0, 2.0]);
        assert!(matches!(result, Err(AnalyzerError::OutOfRange { .. })));
        assert!(device.write_buffer(buffer, 2, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_convolution_with_impulse_kernel() {
        let device = CpuDevice::new();
        let input = device.create_buffer("input", 4 * 16).unwrap();
        let samples: Vec<f32> = (0..16).map(|n| n as f32).collect();
        write_samples(&device, input, 0, &samples).unwrap();

        // Bin 0 picks sample 0 of the window, bin 1 picks sample 1 through the imaginary part.
        let kernels = device.create_buffer("kernels", 4 * 8).unwrap();
        write_samples(&device, kernels, 0, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        let info = device.create_buffer("info", 16).unwrap();
        let table = [KernelInfo { offset: 0, length: 2 }, KernelInfo { offset: 4, length: 2 }];
        device.write_buffer(info, 0, bytemuck::cast_slice(&table)).unwrap();
        let output = device.create_buffer("output", 4 * 16).unwrap();

        let bindings = ConvolutionBindings { input, kernels, kernel_info: info, output };
        let params = ConvolutionParams {
            input_offset: 2,
            output_offset: 1,
            num_frames: 3,
            num_bins: 2,
            hop_length: 4,
            input_length: 16,
            _pad: [0; 2],
        };
        device.dispatch_convolution(&bindings, &params).unwrap();

        let result = read_samples(&device, output, 0, 8).unwrap();
        assert_eq!(result, vec![0.0, 0.0, 2.0, 3.0, 6.0, 7.0, 10.0, 11.0]);
    }

    #[test]
    fn test_convolution_skips_frames_past_input_length() {
        let device = CpuDevice::new();
        let input = device.create_buffer("input", 4 * 8).unwrap();
        write_samples(&device, input, 0, &[1.0; 8]).unwrap();
        let kernels = device.create_buffer("kernels", 4 * 8).unwrap();
        write_samples(&device, kernels, 0, &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let info = device.create_buffer("info", 8).unwrap();
        device
            .write_buffer(info, 0, bytemuck::cast_slice(&[KernelInfo { offset: 0, length: 4 }]))
            .unwrap();
        let output = device.create_buffer("output", 4 * 4).unwrap();
        write_samples(&device, output, 0, &[-1.0; 4]).unwrap();

        let bindings = ConvolutionBindings { input, kernels, kernel_info: info, output };
        let params = ConvolutionParams {
            num_frames: 4,
            num_bins: 1,
            hop_length: 2,
            input_length: 8,
            ..Default::default()
        };
        device.dispatch_convolution(&bindings, &params).unwrap();

        // Frames starting at 0, 2, 4 fit; the frame at 6 would read past the input.
        assert_eq!(read_samples(&device, output, 0, 4).unwrap(), vec![4.0, 4.0, 4.0, -1.0]);
    }

    #[test]
    fn test_texture_copy_and_read() {
        let device = CpuDevice::new();
        let shape = TextureShape { width: 3, height: 4, layers: 2 };
        let texture = device.create_texture("tiles", shape).unwrap();
        let buffer = device.create_buffer("rows", 4 * 12).unwrap();
        let rows: Vec<f32> = (1..=6).map(|n| n as f32).collect();
        write_samples(&device, buffer, 3, &rows).unwrap();

        let region = TextureRegion { layer: 1, row: 2, rows: 2 };
        device.copy_buffer_to_texture(buffer, 12, texture, region).unwrap();

        assert!(samples_from_bytes(&device.read_texture(texture, 0).unwrap())
            .iter()
            .all(|&t| t == 0.0));
        let layer = samples_from_bytes(&device.read_texture(texture, 1).unwrap());
        assert_eq!(&layer[6..], rows.as_slice());
        assert!(device.read_texture(texture, 2).is_err());

        let overflow = TextureRegion { layer: 0, row: 3, rows: 2 };
        assert!(device.copy_buffer_to_texture(buffer, 0, texture, overflow).is_err());
    }

    #[test]
    fn test_lost_device_rejects_work() {
        let device = CpuDevice::new();
        let buffer = device.create_buffer("doomed", 16).unwrap();
        device.simulate_loss();
        assert!(device.is_lost());
        assert!(matches!(
            device.clear_buffer(buffer),
            Err(AnalyzerError::DeviceLost(_))
        ));
        assert!(crate::device::ensure_alive(&device).is_err());
    }

    #[test]
    fn test_destroy_releases_resources() {
        let device = CpuDevice::new();
        let buffer = device.create_buffer("b", 16).unwrap();
        let texture = device
            .create_texture("t", TextureShape { width: 1, height: 1, layers: 1 })
            .unwrap();
        assert_eq!(device.resource_count(), (1, 1));
        device.destroy_buffer(buffer).unwrap();
        device.destroy_texture(texture).unwrap();
        assert_eq!(device.resource_count(), (0, 0));
        assert!(matches!(
            device.destroy_buffer(buffer),
            Err(AnalyzerError::UnknownResource(_))
        ));
    }
}
