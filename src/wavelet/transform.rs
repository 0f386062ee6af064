use std::sync::Arc;

use super::kernel::KernelBank;
use crate::config::{validate_block_layout, validate_frequency_range, AnalyzerConfig};
use crate::device::{
    self, BufferHandle, ComputeDevice, ConvolutionBindings, ConvolutionParams, KernelInfo,
};
use crate::error::{AnalyzerError, Result};

/// Number of whole frames of `max_kernel_length` samples, `hop_length` apart, that fit in
/// `audio_length` samples.
pub fn frame_count(audio_length: usize, max_kernel_length: usize, hop_length: usize) -> usize {
    if audio_length < max_kernel_length || hop_length == 0 {
        return 0;
    }
    (audio_length - max_kernel_length) / hop_length + 1
}

/// Kernel buffers resident on the device.
struct DeviceKernels {
    coefficients: BufferHandle,
    table: BufferHandle,
}

/// CQT convolution over a device-resident input buffer.
///
/// Owns the kernel bank, its packed device copy, and the output buffer, which is treated
/// as a ring of `output_frames` rows of `num_bins` magnitudes.
pub struct WaveletTransform {
    device: Arc<dyn ComputeDevice>,
    bank: KernelBank,
    hop_length: usize,
    kernels: Option<DeviceKernels>,
    output: Option<BufferHandle>,
    output_frames: usize,
    input: Option<(BufferHandle, usize)>,
}

impl WaveletTransform {
    /// Validates the layout, builds the kernels and uploads them.
    pub fn new(
        device: Arc<dyn ComputeDevice>,
        config: &AnalyzerConfig,
        output_frames: usize,
    ) -> Result<Self> {
        Self::validate(config, output_frames)?;
        device::ensure_alive(device.as_ref())?;

        let bank = KernelBank::new(
            config.sample_rate,
            config.f_min,
            config.f_max,
            config.bins_per_octave,
        );
        let kernels = upload_kernels(device.as_ref(), &bank)?;
        let output = create_output(device.as_ref(), output_frames, bank.num_bins())?;

        Ok(Self {
            device,
            bank,
            hop_length: config.hop_length(),
            kernels: Some(kernels),
            output: Some(output),
            output_frames,
            input: None,
        })
    }

    fn validate(config: &AnalyzerConfig, output_frames: usize) -> Result<()> {
        validate_block_layout(config.block_size, config.batch_factor, config.max_blocks)?;
        validate_frequency_range(config.sample_rate, config.f_min, config.f_max)?;
        if config.bins_per_octave == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "bins per octave must be positive".to_string(),
            ));
        }
        if output_frames == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "output ring must hold at least one frame".to_string(),
            ));
        }
        Ok(())
    }

    /// Binds `input` as the convolution source; frames never read past `input_length`.
    pub fn configure(&mut self, input: BufferHandle, input_length: usize) {
        self.input = Some((input, input_length));
    }

    /// Rebuilds and re-uploads the kernels when the frequency layout changed. The output
    /// ring is recreated because its row width follows the bin count. Returns whether a
    /// rebuild happened.
    pub fn set_frequency_range(
        &mut self,
        sample_rate: f32,
        f_min: f32,
        f_max: f32,
        bins_per_octave: u32,
    ) -> Result<bool> {
        self.check_alive()?;
        if self.bank.matches(sample_rate, f_min, f_max, bins_per_octave) {
            return Ok(false);
        }
        validate_frequency_range(sample_rate, f_min, f_max)?;
        if bins_per_octave == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "bins per octave must be positive".to_string(),
            ));
        }

        let bank = KernelBank::new(sample_rate, f_min, f_max, bins_per_octave);
        self.release_kernels()?;
        self.kernels = Some(upload_kernels(self.device.as_ref(), &bank)?);
        self.bank = bank;
        self.recreate_output(self.output_frames)?;
        log::info!(
            "kernels rebuilt for {:.1}..{:.1} Hz, {} bins per octave",
            f_min,
            f_max,
            bins_per_octave
        );
        Ok(true)
    }

    /// Applies a new configuration: kernels are rebuilt only when the frequency layout
    /// changed, the output ring is always recreated and the input binding dropped.
    pub fn reconfigure(&mut self, config: &AnalyzerConfig, output_frames: usize) -> Result<bool> {
        Self::validate(config, output_frames)?;
        let rebuilt = self.set_frequency_range(
            config.sample_rate,
            config.f_min,
            config.f_max,
            config.bins_per_octave,
        )?;
        self.hop_length = config.hop_length();
        if !rebuilt || output_frames != self.output_frames {
            self.recreate_output(output_frames)?;
        }
        self.input = None;
        Ok(rebuilt)
    }

    /// Enqueues the convolution of `num_frames` frames starting at `input_offset` into
    /// output rows `output_offset..output_offset + num_frames`.
    pub fn transform(&self, input_offset: usize, output_offset: usize, num_frames: usize) -> Result<()> {
        self.check_alive()?;
        let (input, input_length) = self
            .input
            .ok_or(AnalyzerError::NotConfigured("wavelet transform input"))?;
        let kernels = self.kernels.as_ref().ok_or(AnalyzerError::Destroyed("wavelet transform"))?;
        let output = self.output.ok_or(AnalyzerError::Destroyed("wavelet transform"))?;

        if output_offset + num_frames > self.output_frames {
            return Err(AnalyzerError::OutOfRange {
                what: "output ring",
                offset: output_offset,
                end: output_offset + num_frames,
                capacity: self.output_frames,
            });
        }
        if num_frames == 0 {
            return Ok(());
        }

        let bindings = ConvolutionBindings {
            input,
            kernels: kernels.coefficients,
            kernel_info: kernels.table,
            output,
        };
        let params = ConvolutionParams {
            input_offset: input_offset as u32,
            output_offset: output_offset as u32,
            num_frames: num_frames as u32,
            num_bins: self.bank.num_bins() as u32,
            hop_length: self.hop_length as u32,
            input_length: input_length as u32,
            _pad: [0; 2],
        };
        self.device.dispatch_convolution(&bindings, &params)
    }

    /// Frames available in `audio_length` samples at this transform's kernel and hop.
    pub fn frame_count(&self, audio_length: usize) -> usize {
        frame_count(audio_length, self.bank.max_length(), self.hop_length)
    }

    /// Reads `count` output rows starting at ring row `first`, `count * num_bins`
    /// magnitudes in frame-major order.
    pub fn read_output(&self, first: usize, count: usize) -> Result<Vec<f32>> {
        self.check_alive()?;
        let output = self.output_buffer()?;
        if first + count > self.output_frames {
            return Err(AnalyzerError::OutOfRange {
                what: "output ring",
                offset: first,
                end: first + count,
                capacity: self.output_frames,
            });
        }
        let bins = self.bank.num_bins();
        device::read_samples(self.device.as_ref(), output, first * bins, count * bins)
    }

    pub fn output_buffer(&self) -> Result<BufferHandle> {
        self.output.ok_or(AnalyzerError::Destroyed("wavelet transform"))
    }

    pub fn output_frames(&self) -> usize {
        self.output_frames
    }

    pub fn num_bins(&self) -> usize {
        self.bank.num_bins()
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    pub fn max_kernel_length(&self) -> usize {
        self.bank.max_length()
    }

    pub fn frequencies(&self) -> Vec<f32> {
        self.bank.frequencies()
    }

    pub fn bank(&self) -> &KernelBank {
        &self.bank
    }

    /// Releases kernels and the output ring. Later calls are no-ops.
    pub fn destroy(&mut self) -> Result<()> {
        self.input = None;
        if self.device.is_lost() {
            self.kernels = None;
            self.output = None;
            return Ok(());
        }
        self.release_kernels()?;
        if let Some(output) = self.output.take() {
            self.device.destroy_buffer(output)?;
        }
        Ok(())
    }

    fn recreate_output(&mut self, output_frames: usize) -> Result<()> {
        if let Some(output) = self.output.take() {
            self.device.destroy_buffer(output)?;
        }
        self.output = Some(create_output(
            self.device.as_ref(),
            output_frames,
            self.bank.num_bins(),
        )?);
        self.output_frames = output_frames;
        Ok(())
    }

    fn release_kernels(&mut self) -> Result<()> {
        if let Some(kernels) = self.kernels.take() {
            self.device.destroy_buffer(kernels.coefficients)?;
            self.device.destroy_buffer(kernels.table)?;
        }
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.kernels.is_none() {
            return Err(AnalyzerError::Destroyed("wavelet transform"));
        }
        device::ensure_alive(self.device.as_ref())
    }
}

fn upload_kernels(device: &dyn ComputeDevice, bank: &KernelBank) -> Result<DeviceKernels> {
    let (coefficients, table) = bank.pack();
    let coefficient_buffer = device.create_buffer("cqt kernels", device::byte_len(coefficients.len()))?;
    device::write_samples(device, coefficient_buffer, 0, &coefficients)?;

    let table_bytes: &[u8] = bytemuck::cast_slice(&table);
    let table_buffer = device.create_buffer(
        "cqt kernel table",
        (table.len() * std::mem::size_of::<KernelInfo>()) as u64,
    )?;
    device.write_buffer(table_buffer, 0, table_bytes)?;

    log::debug!(
        "uploaded {} kernels ({} coefficients)",
        table.len(),
        coefficients.len()
    );
    Ok(DeviceKernels {
        coefficients: coefficient_buffer,
        table: table_buffer,
    })
}

fn create_output(device: &dyn ComputeDevice, frames: usize, num_bins: usize) -> Result<BufferHandle> {
    device.create_buffer("cqt output ring", device::byte_len(frames * num_bins))
}
