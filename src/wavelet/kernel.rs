use std::f64::consts::PI;

use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::{bin_frequency, num_bins, q_factor};
use crate::device::KernelInfo;
use crate::error::{AnalyzerError, Result};

pub const MIN_KERNEL_LENGTH: usize = 32;
pub const MAX_KERNEL_LENGTH: usize = 16384;

/// `clamp(ceil(q * sample_rate / frequency), 32, 16384)`
pub fn kernel_length(q: f64, sample_rate: f32, frequency: f32) -> usize {
    let ideal = (q * sample_rate as f64 / frequency as f64).ceil() as usize;
    ideal.clamp(MIN_KERNEL_LENGTH, MAX_KERNEL_LENGTH)
}

/// Basis function of one CQT bin: a Hamming-windowed complex exponential with unit
/// energy.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    pub frequency: f32,
    pub real: Vec<f32>,
    pub imag: Vec<f32>,
}

impl Kernel {
    pub fn new(frequency: f32, sample_rate: f32, q: f64) -> Self {
        let length = kernel_length(q, sample_rate, frequency);
        let omega = 2.0 * PI * frequency as f64 / sample_rate as f64;
        let denominator = (length - 1) as f64;

        let window: Vec<f64> = (0..length)
            .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f64 / denominator).cos())
            .collect();
        // |e^{j omega n}| = 1, so the energy is that of the window alone.
        let norm = window.iter().map(|w| w * w).sum::<f64>().sqrt();

        let (real, imag) = window
            .iter()
            .enumerate()
            .map(|(n, w)| {
                let phase = omega * n as f64;
                ((w * phase.cos() / norm) as f32, (w * phase.sin() / norm) as f32)
            })
            .unzip();

        Self {
            frequency,
            real,
            imag,
        }
    }

    pub fn len(&self) -> usize {
        self.real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }

    /// `sum(re^2 + im^2)`
    pub fn energy(&self) -> f64 {
        self.real
            .iter()
            .zip(&self.imag)
            .map(|(&re, &im)| re as f64 * re as f64 + im as f64 * im as f64)
            .sum()
    }
}

/// Every bin's kernel for one frequency layout, lowest frequency first.
#[derive(Clone, Debug)]
pub struct KernelBank {
    kernels: Vec<Kernel>,
    sample_rate: f32,
    f_min: f32,
    f_max: f32,
    bins_per_octave: u32,
}

impl KernelBank {
    pub fn new(sample_rate: f32, f_min: f32, f_max: f32, bins_per_octave: u32) -> Self {
        let q = q_factor(bins_per_octave);
        let kernels: Vec<Kernel> = (0..num_bins(f_min, f_max, bins_per_octave))
            .map(|bin| Kernel::new(bin_frequency(f_min, bin, bins_per_octave), sample_rate, q))
            .collect();

        log::debug!(
            "kernel bank: {} bins, Q {:.3}, lengths {}..{}",
            kernels.len(),
            q,
            kernels.last().map_or(0, Kernel::len),
            kernels.first().map_or(0, Kernel::len)
        );

        Self {
            kernels,
            sample_rate,
            f_min,
            f_max,
            bins_per_octave,
        }
    }

    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn num_bins(&self) -> usize {
        self.kernels.len()
    }

    pub fn frequencies(&self) -> Vec<f32> {
        self.kernels.iter().map(|kernel| kernel.frequency).collect()
    }

    /// Length of the lowest bin's kernel, i.e. the audio needed for one frame.
    pub fn max_length(&self) -> usize {
        self.kernels.iter().map(Kernel::len).max().unwrap_or(0)
    }

    /// True when this bank was built for the given layout.
    pub fn matches(&self, sample_rate: f32, f_min: f32, f_max: f32, bins_per_octave: u32) -> bool {
        self.sample_rate == sample_rate
            && self.f_min == f_min
            && self.f_max == f_max
            && self.bins_per_octave == bins_per_octave
    }

    /// Packs all coefficients into one array (per bin: real then imaginary) and
    /// returns it with the per-bin offset table.
    pub fn pack(&self) -> (Vec<f32>, Vec<KernelInfo>) {
        let total = self.kernels.iter().map(|kernel| 2 * kernel.len()).sum();
        let mut coefficients = Vec::with_capacity(total);
        let mut table = Vec::with_capacity(self.kernels.len());
        for kernel in &self.kernels {
            table.push(KernelInfo {
                offset: coefficients.len() as u32,
                length: kernel.len() as u32,
            });
            coefficients.extend_from_slice(&kernel.real);
            coefficients.extend_from_slice(&kernel.imag);
        }
        (coefficients, table)
    }

    /// Magnitude spectrum of bin `bin`'s kernel zero-padded to `fft_size`, for bins
    /// `0..=fft_size / 2`.
    pub fn kernel_spectrum(&self, bin: usize, fft_size: usize) -> Result<Vec<f32>> {
        let kernel = self.kernels.get(bin).ok_or(AnalyzerError::OutOfRange {
            what: "kernel bank",
            offset: bin,
            end: bin + 1,
            capacity: self.kernels.len(),
        })?;
        if fft_size < kernel.len() {
            return Err(AnalyzerError::InvalidConfig(format!(
                "fft size {} is shorter than kernel {} ({} samples)",
                fft_size,
                bin,
                kernel.len()
            )));
        }

        let mut buffer: Vec<Complex<f32>> = kernel
            .real
            .iter()
            .zip(&kernel.imag)
            .map(|(&re, &im)| Complex { re, im })
            .collect();
        buffer.resize(fft_size, Complex { re: 0.0, im: 0.0 });

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        fft.process(&mut buffer);

        Ok(buffer.iter().take(fft_size / 2 + 1).map(|c| c.norm()).collect())
    }
}
