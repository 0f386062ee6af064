//! Multi-band decimation cascade.
//!
//! The analyzed range is split into octave-spaced bands. Each band low-passes its input
//! with two cascaded biquad sections and keeps every `decimation_factor`-th sample; the
//! decimated signal is the input of the next, narrower band. The undecimated top band
//! above the highest cutoff is implicit.

use serde::Serialize;

use crate::biquad::{CascadedBiquad, Filter};
use crate::config::{validate_block_layout, validate_frequency_range};
use crate::error::{AnalyzerError, Result};

/// A band's output rate must stay at least this multiple of its cutoff.
pub const NYQUIST_MARGIN: f32 = 2.2;

/// A bin belongs to the lowest band whose cutoff exceeds the bin frequency by this ratio.
pub const BAND_MARGIN: f32 = 1.1;

/// One stage of the cascade.
#[derive(Clone, Debug)]
pub struct Band {
    pub cutoff: f32,
    pub decimation_factor: usize,
    /// Product of this band's factor and every stage above it
    pub cumulative_factor: usize,
    /// Rate of the signal entering this stage
    pub input_sample_rate: f32,
    /// Rate after this stage decimates
    pub effective_sample_rate: f32,
    pub filter: CascadedBiquad,
    phase: usize,
}

/// Analytic response of one band's filter at log-spaced frequencies.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterResponse {
    pub frequencies: Vec<f32>,
    pub magnitude_db: Vec<f32>,
    pub phase_radians: Vec<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct Decimator {
    /// Ordered by ascending cutoff; processing walks the list from the top.
    bands: Vec<Band>,
    sample_rate: f32,
    fallbacks: usize,
}

impl Decimator {
    /// A decimator with no bands passes nothing through `process_block`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes band cutoffs, decimation factors and filters.
    pub fn configure(
        &mut self,
        num_bands: usize,
        f_min: f32,
        f_max: f32,
        sample_rate: f32,
        max_block_size: usize,
        batch_factor: usize,
    ) -> Result<()> {
        validate_frequency_range(sample_rate, f_min, f_max)?;
        validate_block_layout(max_block_size, batch_factor, 1)?;

        let step = (f_max as f64 / f_min as f64).log2() / (num_bands + 1) as f64;
        let cutoffs: Vec<f32> = (0..num_bands)
            .map(|i| (f_min as f64 * 2f64.powf((i + 1) as f64 * step)) as f32)
            .collect();

        let mut bands = Vec::with_capacity(num_bands);
        let mut rate = sample_rate;
        let mut cumulative = 1usize;
        let mut fallbacks = 0;

        for &cutoff in cutoffs.iter().rev() {
            let ideal = ((rate / (NYQUIST_MARGIN * cutoff)).floor() as usize).max(1);
            let factor = match snap_factor(ideal, cumulative, max_block_size, batch_factor) {
                Some(factor) => factor,
                None => {
                    fallbacks += 1;
                    log::warn!(
                        "no valid decimation factor for band at {:.1} Hz (ideal {}), using 1",
                        cutoff,
                        ideal
                    );
                    1
                }
            };

            let filter = Self::design_filter(cutoff, rate);
            let effective = rate / factor as f32;
            cumulative *= factor;

            bands.push(Band {
                cutoff,
                decimation_factor: factor,
                cumulative_factor: cumulative,
                input_sample_rate: rate,
                effective_sample_rate: effective,
                filter,
                phase: 0,
            });
            rate = effective;
        }
        bands.reverse();

        for band in &bands {
            log::debug!(
                "band cutoff {:.1} Hz: factor {} (cumulative {}), {:.1} Hz -> {:.1} Hz",
                band.cutoff,
                band.decimation_factor,
                band.cumulative_factor,
                band.input_sample_rate,
                band.effective_sample_rate
            );
        }

        self.bands = bands;
        self.sample_rate = sample_rate;
        self.fallbacks = fallbacks;
        Ok(())
    }

    /// Two-section low-pass at `cutoff` for a signal sampled at `sample_rate`, with
    /// zeroed delay taps.
    pub fn design_filter(cutoff: f32, sample_rate: f32) -> CascadedBiquad {
        CascadedBiquad::lowpass(sample_rate, cutoff)
    }

    /// Filters and decimates `samples` through the cascade; returns one array per band
    /// in ascending-cutoff order.
    pub fn process_block(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut outputs = vec![Vec::new(); self.bands.len()];
        let mut signal = samples.to_vec();

        for index in (0..self.bands.len()).rev() {
            let band = &mut self.bands[index];
            band.filter.process_block(&mut signal);

            let factor = band.decimation_factor;
            let mut decimated = Vec::with_capacity(signal.len() / factor + 1);
            for &sample in &signal {
                if band.phase == 0 {
                    decimated.push(sample);
                }
                band.phase = (band.phase + 1) % factor;
            }

            signal.clear();
            signal.extend_from_slice(&decimated);
            outputs[index] = decimated;
        }
        outputs
    }

    /// Evaluates band `band`'s transfer function at `num_points` log-spaced frequencies
    /// between `f_min` and `f_max`.
    pub fn filter_response(
        &self,
        band: usize,
        num_points: usize,
        f_min: f32,
        f_max: f32,
    ) -> Result<FilterResponse> {
        let filter = &self
            .bands
            .get(band)
            .ok_or(AnalyzerError::OutOfRange {
                what: "decimator bands",
                offset: band,
                end: band + 1,
                capacity: self.bands.len(),
            })?
            .filter;
        if !(f_min > 0.0 && f_max >= f_min) {
            return Err(AnalyzerError::InvalidConfig(format!(
                "response range {}..{} Hz is invalid",
                f_min, f_max
            )));
        }

        let ratio = f_max as f64 / f_min as f64;
        let frequencies: Vec<f32> = (0..num_points)
            .map(|i| {
                let t = if num_points > 1 {
                    i as f64 / (num_points - 1) as f64
                } else {
                    0.0
                };
                (f_min as f64 * ratio.powf(t)) as f32
            })
            .collect();

        let mut magnitude_db = Vec::with_capacity(num_points);
        let mut phase_radians = Vec::with_capacity(num_points);
        for &frequency in &frequencies {
            let h = filter.response(frequency as f64);
            magnitude_db.push((20.0 * h.norm().max(1e-12).log10()) as f32);
            phase_radians.push(h.arg() as f32);
        }

        Ok(FilterResponse {
            frequencies,
            magnitude_db,
            phase_radians,
        })
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Number of bands that fell back to factor 1 during the last `configure`.
    pub fn fallback_count(&self) -> usize {
        self.fallbacks
    }

    /// The lowest band that can represent `frequency` with a 10% margin below its
    /// cutoff; `None` means the undecimated top band.
    pub fn band_for_frequency(&self, frequency: f32) -> Option<&Band> {
        self.bands
            .iter()
            .find(|band| frequency * BAND_MARGIN < band.cutoff)
    }

    pub fn reset(&mut self) {
        for band in self.bands.iter_mut() {
            band.filter.reset();
            band.phase = 0;
        }
    }
}

/// Largest factor `<= ideal` keeping `block_size / (batch_factor * cumulative * factor)`
/// a positive integer. `None` when only the trivial factor remains for `ideal > 1`.
fn snap_factor(ideal: usize, cumulative: usize, block_size: usize, batch_factor: usize) -> Option<usize> {
    let valid = |factor: usize| {
        let divisor = batch_factor * cumulative * factor;
        divisor <= block_size && block_size % divisor == 0
    };
    let factor = (1..=ideal).rev().find(|&factor| valid(factor))?;
    if factor == 1 && ideal > 1 {
        None
    } else {
        Some(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(num_bands: usize, block_size: usize, batch_factor: usize) -> Decimator {
        let mut decimator = Decimator::new();
        decimator
            .configure(num_bands, 32.7, 16_000.0, 48_000.0, block_size, batch_factor)
            .expect("valid decimator config");
        decimator
    }

    #[test]
    fn test_factors_divide_block() {
        for (num_bands, block_size, batch_factor) in
            [(6, 4096, 16), (4, 2048, 8), (8, 4096, 4), (3, 1024, 32)]
        {
            let decimator = configured(num_bands, block_size, batch_factor);
            assert_eq!(decimator.num_bands(), num_bands);
            for band in decimator.bands() {
                assert!(band.decimation_factor >= 1);
                assert_eq!(block_size % (batch_factor * band.decimation_factor), 0);
                assert_eq!(block_size % (batch_factor * band.cumulative_factor), 0);
                assert!(band.effective_sample_rate >= NYQUIST_MARGIN * band.cutoff);
            }
        }
    }

    #[test]
    fn test_cutoffs_are_octave_spaced() {
        let decimator = configured(6, 4096, 16);
        let cutoffs: Vec<f32> = decimator.bands().iter().map(|b| b.cutoff).collect();
        let ratios: Vec<f32> = cutoffs.windows(2).map(|w| w[1] / w[0]).collect();
        for ratio in &ratios {
            assert!((ratio - ratios[0]).abs() < 1e-3);
        }
        let step = (16_000.0f64 / 32.7).log2() / 7.0;
        assert!((cutoffs[0] as f64 - 32.7 * 2f64.powf(step)).abs() < 0.01);
    }

    #[test]
    fn test_cumulative_factor_decreases_upward() {
        let decimator = configured(6, 4096, 16);
        let bands = decimator.bands();
        for pair in bands.windows(2) {
            assert_eq!(
                pair[0].cumulative_factor,
                pair[1].cumulative_factor * pair[0].decimation_factor
            );
            assert_eq!(pair[0].input_sample_rate, pair[1].effective_sample_rate);
        }
        assert_eq!(bands.last().unwrap().input_sample_rate, 48_000.0);
    }

    #[test]
    fn test_fallback_to_unit_factor() {
        // block / batch == 1 leaves no room for any factor above one
        let decimator = configured(3, 256, 256);
        assert!(decimator.bands().iter().all(|b| b.decimation_factor == 1));
        assert_eq!(decimator.fallback_count(), 3);
    }

    #[test]
    fn test_process_block_lengths() {
        let mut decimator = configured(6, 4096, 16);
        let samples = vec![0.25f32; 4096];
        let outputs = decimator.process_block(&samples);
        assert_eq!(outputs.len(), 6);
        for (band, output) in decimator.bands().iter().zip(&outputs) {
            assert_eq!(output.len(), 4096 / band.cumulative_factor);
        }
    }

    #[test]
    fn test_process_block_passes_dc() {
        let mut decimator = configured(4, 4096, 16);
        let samples = vec![1.0f32; 4096];
        let mut last = Vec::new();
        for _ in 0..20 {
            last = decimator.process_block(&samples);
        }
        for output in &last {
            let settled = output.last().copied().unwrap_or(0.0);
            assert!((settled - 1.0).abs() < 1e-3, "settled at {}", settled);
        }
    }

    #[test]
    fn test_filter_response_shape() {
        let decimator = configured(6, 4096, 16);
        let band = &decimator.bands()[2];
        let response = decimator
            .filter_response(2, 64, 10.0, band.input_sample_rate * 0.45)
            .unwrap();
        assert_eq!(response.frequencies.len(), 64);
        assert_eq!(response.magnitude_db.len(), 64);
        assert_eq!(response.phase_radians.len(), 64);
        assert!(response.frequencies.windows(2).all(|w| w[1] > w[0]));
        assert!(response.magnitude_db[0].abs() < 0.1);
        assert!(*response.magnitude_db.last().unwrap() < -30.0);

        assert!(decimator.filter_response(6, 8, 10.0, 100.0).is_err());
    }

    #[test]
    fn test_band_for_frequency_margin() {
        let decimator = configured(6, 4096, 16);
        let lowest = &decimator.bands()[0];
        let inside = lowest.cutoff / (BAND_MARGIN * 1.01);
        assert_eq!(
            decimator.band_for_frequency(inside).map(|b| b.cutoff),
            Some(lowest.cutoff)
        );
        let top = decimator.bands().last().unwrap().cutoff;
        assert!(decimator.band_for_frequency(top).is_none());
    }
}
