use std::f64::consts::PI;

use rustfft::num_complex::Complex;

/// Q of the two cascaded sections. Together they approximate a 4th-order elliptic
/// low-pass with roughly 60 dB of stopband attenuation.
pub const SECTION_Q: [f64; 2] = [0.9, 0.6];

/// Trait defining the basic filter interface.
pub trait Filter {
    fn process(&mut self, input: f32) -> f32;
    fn reset(&mut self);

    /// Filters `samples` in place.
    fn process_block(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample = self.process(*sample);
        }
    }
}

/// A second-order low-pass section using Direct Form II.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub sample_rate: f32,
    pub frequency: f32,
    pub q: f32,
    // Coefficients (a0 normalized to 1)
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    // Delay taps w[n-1], w[n-2]
    w1: f32,
    w2: f32,
}

impl Biquad {
    /// Designs a low-pass section with the bilinear transform, pre-warping the cutoff so
    /// the analog and digital -3 dB points coincide.
    pub fn lowpass(sample_rate: f32, frequency: f32, q: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        let frequency = frequency.clamp(1.0, sample_rate * 0.49);
        let q = q.max(0.01);

        let k = (PI * frequency as f64 / sample_rate as f64).tan();
        let k2 = k * k;
        let norm = 1.0 / (1.0 + k / q as f64 + k2);
        let b0 = k2 * norm;

        Self {
            sample_rate,
            frequency,
            q,
            b0: b0 as f32,
            b1: (2.0 * b0) as f32,
            b2: b0 as f32,
            a1: (2.0 * (k2 - 1.0) * norm) as f32,
            a2: ((1.0 - k / q as f64 + k2) * norm) as f32,
            w1: 0.0,
            w2: 0.0,
        }
    }

    /// `[b0, b1, b2, a1, a2]`
    pub fn coefficients(&self) -> [f32; 5] {
        [self.b0, self.b1, self.b2, self.a1, self.a2]
    }

    /// Transfer function evaluated on the unit circle at `frequency` Hz.
    pub fn response(&self, frequency: f64) -> Complex<f64> {
        let omega = 2.0 * PI * frequency / self.sample_rate as f64;
        let z1 = Complex::from_polar(1.0, -omega);
        let z2 = z1 * z1;
        let numerator = Complex::new(self.b0 as f64, 0.0) + z1 * self.b1 as f64 + z2 * self.b2 as f64;
        let denominator = Complex::new(1.0, 0.0) + z1 * self.a1 as f64 + z2 * self.a2 as f64;
        numerator / denominator
    }
}

impl Filter for Biquad {
    #[inline(always)]
    fn process(&mut self, input: f32) -> f32 {
        // w[n] = x[n] - a1*w[n-1] - a2*w[n-2]
        // y[n] = b0*w[n] + b1*w[n-1] + b2*w[n-2]
        let w = input - self.a1 * self.w1 - self.a2 * self.w2;
        let output = self.b0 * w + self.b1 * self.w1 + self.b2 * self.w2;
        self.w2 = self.w1;
        self.w1 = if w.abs() < 1e-18 { 0.0 } else { w };
        output
    }

    fn reset(&mut self) {
        self.w1 = 0.0;
        self.w2 = 0.0;
    }
}

/// Two low-pass sections in series (24 dB/octave) with distinct Q per section.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CascadedBiquad {
    pub first: Biquad,
    pub second: Biquad,
}

impl CascadedBiquad {
    pub fn lowpass(sample_rate: f32, cutoff: f32) -> Self {
        Self {
            first: Biquad::lowpass(sample_rate, cutoff, SECTION_Q[0] as f32),
            second: Biquad::lowpass(sample_rate, cutoff, SECTION_Q[1] as f32),
        }
    }

    pub fn response(&self, frequency: f64) -> Complex<f64> {
        self.first.response(frequency) * self.second.response(frequency)
    }

    pub fn sample_rate(&self) -> f32 {
        self.first.sample_rate
    }
}

impl Filter for CascadedBiquad {
    #[inline(always)]
    fn process(&mut self, input: f32) -> f32 {
        let temp = self.first.process(input);
        self.second.process(temp)
    }

    fn reset(&mut self) {
        self.first.reset();
        self.second.reset();
    }
}
