//! Analyzer configuration, loadable from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalyzerError, Result};

/// Every tunable of a CQT session.
///
/// Frequency parameters shape the kernel bank; the block layout (`block_size`,
/// `batch_factor`) fixes the hop length; the remaining fields size the bounded
/// buffers and rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalyzerConfig {
    /// Input sample rate in Hz
    pub sample_rate: f32,
    /// Lowest analyzed frequency in Hz (frequency of bin 0)
    pub f_min: f32,
    /// Upper bound of the analyzed range in Hz
    pub f_max: f32,
    pub bins_per_octave: u32,
    /// Samples per accumulator block; must be a power of two
    pub block_size: usize,
    /// Analysis frames per block; hop length is `block_size / batch_factor`
    pub batch_factor: usize,
    /// Capacity of the accumulator's block ring
    pub max_blocks: usize,
    /// Capacity of the device working buffer, in samples
    pub working_buffer_size: usize,
    /// Number of decimated bands below the undecimated top band
    pub num_bands: usize,
    /// Frames per texture tile
    pub time_slice_count: usize,
    /// Tiles in the texture ring (and frame slots in the output ring)
    pub texture_ring_size: usize,
    /// Layers of the persistent history texture array
    pub history_layers: usize,
    /// Bound on queued accumulator events
    pub event_queue_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            f_min: 32.7,
            f_max: 16_000.0,
            bins_per_octave: 12,
            block_size: 4096,
            batch_factor: 16,
            max_blocks: 16,
            working_buffer_size: 65_536,
            num_bands: 6,
            time_slice_count: 128,
            texture_ring_size: 8,
            history_layers: 32,
            event_queue_capacity: 64,
        }
    }
}

impl AnalyzerConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a JSON configuration. Missing keys take defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every construction-time constraint of the pipeline.
    pub fn validate(&self) -> Result<()> {
        validate_block_layout(self.block_size, self.batch_factor, self.max_blocks)?;
        validate_frequency_range(self.sample_rate, self.f_min, self.f_max)?;

        if self.bins_per_octave == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "bins per octave must be positive".to_string(),
            ));
        }
        if self.working_buffer_size < 2 * self.block_size {
            return Err(AnalyzerError::InvalidConfig(format!(
                "working buffer ({} samples) must hold at least two blocks of {} samples",
                self.working_buffer_size, self.block_size
            )));
        }
        for (name, value) in [
            ("time slice count", self.time_slice_count),
            ("texture ring size", self.texture_ring_size),
            ("history layers", self.history_layers),
            ("event queue capacity", self.event_queue_capacity),
        ] {
            if value == 0 {
                return Err(AnalyzerError::InvalidConfig(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Samples between consecutive analysis frames.
    pub fn hop_length(&self) -> usize {
        self.block_size / self.batch_factor.max(1)
    }

    /// Constant ratio of center frequency to bandwidth.
    pub fn q_factor(&self) -> f64 {
        q_factor(self.bins_per_octave)
    }

    pub fn num_bins(&self) -> usize {
        num_bins(self.f_min, self.f_max, self.bins_per_octave)
    }

    /// Center frequency of every bin, strictly increasing.
    pub fn frequencies(&self) -> Vec<f32> {
        (0..self.num_bins())
            .map(|bin| bin_frequency(self.f_min, bin, self.bins_per_octave))
            .collect()
    }

    /// True when kernels must be rebuilt to move from `self` to `other`.
    pub fn frequency_params_differ(&self, other: &AnalyzerConfig) -> bool {
        self.sample_rate != other.sample_rate
            || self.f_min != other.f_min
            || self.f_max != other.f_max
            || self.bins_per_octave != other.bins_per_octave
    }
}

/// `Q = 1 / (2^(1/bins_per_octave) - 1)`
pub fn q_factor(bins_per_octave: u32) -> f64 {
    1.0 / (2f64.powf(1.0 / bins_per_octave as f64) - 1.0)
}

/// `ceil(bins_per_octave * log2(f_max / f_min))`
pub fn num_bins(f_min: f32, f_max: f32, bins_per_octave: u32) -> usize {
    (bins_per_octave as f64 * (f_max as f64 / f_min as f64).log2()).ceil() as usize
}

/// `f_min * 2^(bin / bins_per_octave)`
pub fn bin_frequency(f_min: f32, bin: usize, bins_per_octave: u32) -> f32 {
    (f_min as f64 * 2f64.powf(bin as f64 / bins_per_octave as f64)) as f32
}

/// Validates the block layout shared by the accumulator and the transform.
pub fn validate_block_layout(block_size: usize, batch_factor: usize, max_blocks: usize) -> Result<()> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(AnalyzerError::BlockSizeNotPowerOfTwo(block_size));
    }
    if batch_factor == 0 || block_size % batch_factor != 0 {
        return Err(AnalyzerError::InvalidBatchFactor {
            block_size,
            batch_factor,
        });
    }
    if max_blocks == 0 {
        return Err(AnalyzerError::InvalidMaxBlocks(max_blocks));
    }
    Ok(())
}

pub fn validate_frequency_range(sample_rate: f32, f_min: f32, f_max: f32) -> Result<()> {
    let valid = sample_rate > 0.0
        && f_min > 0.0
        && f_min < f_max
        && f_max <= sample_rate / 2.0
        && f_min.is_finite()
        && f_max.is_finite();
    if !valid {
        return Err(AnalyzerError::InvalidFrequencyRange {
            f_min,
            f_max,
            sample_rate,
        });
    }
    Ok(())
}
