//! Biquad filters and the resonant Filter effect.
//!
//! Coefficient formulas from the Audio EQ Cookbook (Robert Bristow-Johnson).

use crate::parameter::{ParamSpec, value_at};
use std::f64::consts::PI;

/// Filter type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
    Notch,
    Peaking,
    LowShelf,
    HighShelf,
    Allpass,
}

impl FilterType {
    /// Map the Filter effect's `mode` parameter onto a response.
    pub fn from_mode(mode: f64) -> Self {
        match mode.round() as i64 {
            1 => FilterType::Highpass,
            2 => FilterType::Bandpass,
            3 => FilterType::Notch,
            _ => FilterType::Lowpass,
        }
    }
}

/// A biquad IIR filter (2nd order).
///
/// Implements the standard Direct Form II Transposed structure.
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    pub filter_type: FilterType,
    pub frequency: f64,
    pub q: f64,
    /// Used by Peaking and the shelves.
    pub gain_db: f64,

    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,

    z1: f64,
    z2: f64,

    sample_rate: f64,
    dirty: bool,
}

impl BiquadFilter {
    pub fn new(filter_type: FilterType, sample_rate: f64) -> Self {
        let mut f = BiquadFilter {
            filter_type,
            frequency: 1000.0,
            q: 0.707, // Butterworth
            gain_db: 0.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
            sample_rate,
            dirty: true,
        };
        f.update_coefficients();
        f
    }

    /// Recompute filter coefficients from current parameters.
    pub fn update_coefficients(&mut self) {
        let nyquist = self.sample_rate * 0.5;
        let freq = self.frequency.clamp(1.0, nyquist * 0.999);
        let q = self.q.max(0.01);
        let w0 = 2.0 * PI * freq / self.sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();
        let alpha = sin_w0 / (2.0 * q);
        let a_lin = 10.0_f64.powf(self.gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match self.filter_type {
            FilterType::Lowpass => {
                let b1 = 1.0 - cos_w0;
                let b0 = b1 / 2.0;
                (b0, b1, b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
            }
            FilterType::Highpass => {
                let b0 = (1.0 + cos_w0) / 2.0;
                let b1 = -(1.0 + cos_w0);
                (b0, b1, b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
            }
            FilterType::Bandpass => (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
            FilterType::Notch => (
                1.0,
                -2.0 * cos_w0,
                1.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterType::Peaking => (
                1.0 + alpha * a_lin,
                -2.0 * cos_w0,
                1.0 - alpha * a_lin,
                1.0 + alpha / a_lin,
                -2.0 * cos_w0,
                1.0 - alpha / a_lin,
            ),
            FilterType::LowShelf => {
                let sq = 2.0 * a_lin.sqrt() * alpha;
                (
                    a_lin * ((a_lin + 1.0) - (a_lin - 1.0) * cos_w0 + sq),
                    2.0 * a_lin * ((a_lin - 1.0) - (a_lin + 1.0) * cos_w0),
                    a_lin * ((a_lin + 1.0) - (a_lin - 1.0) * cos_w0 - sq),
                    (a_lin + 1.0) + (a_lin - 1.0) * cos_w0 + sq,
                    -2.0 * ((a_lin - 1.0) + (a_lin + 1.0) * cos_w0),
                    (a_lin + 1.0) + (a_lin - 1.0) * cos_w0 - sq,
                )
            }
            FilterType::HighShelf => {
                let sq = 2.0 * a_lin.sqrt() * alpha;
                (
                    a_lin * ((a_lin + 1.0) + (a_lin - 1.0) * cos_w0 + sq),
                    -2.0 * a_lin * ((a_lin - 1.0) + (a_lin + 1.0) * cos_w0),
                    a_lin * ((a_lin + 1.0) + (a_lin - 1.0) * cos_w0 - sq),
                    (a_lin + 1.0) - (a_lin - 1.0) * cos_w0 + sq,
                    2.0 * ((a_lin - 1.0) - (a_lin + 1.0) * cos_w0),
                    (a_lin + 1.0) - (a_lin - 1.0) * cos_w0 - sq,
                )
            }
            FilterType::Allpass => (
                1.0 - alpha,
                -2.0 * cos_w0,
                1.0 + alpha,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
        };

        // Normalize by a0
        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
        self.dirty = false;
    }

    /// Process a single sample through the filter.
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        if self.dirty {
            self.update_coefficients();
        }

        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    /// Reset filter state.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Set frequency and mark coefficients dirty.
    pub fn set_frequency(&mut self, freq: f64) {
        if freq != self.frequency {
            self.frequency = freq;
            self.dirty = true;
        }
    }

    /// Set Q and mark coefficients dirty.
    pub fn set_q(&mut self, q: f64) {
        if q != self.q {
            self.q = q;
            self.dirty = true;
        }
    }

    pub fn set_gain_db(&mut self, gain_db: f64) {
        if gain_db != self.gain_db {
            self.gain_db = gain_db;
            self.dirty = true;
        }
    }

    pub fn set_type(&mut self, filter_type: FilterType) {
        if filter_type != self.filter_type {
            self.filter_type = filter_type;
            self.dirty = true;
        }
    }
}

/// The same biquad on both channels.
#[derive(Debug, Clone)]
pub struct StereoBiquad {
    pub left: BiquadFilter,
    pub right: BiquadFilter,
}

impl StereoBiquad {
    pub fn new(filter_type: FilterType, sample_rate: f64) -> Self {
        Self {
            left: BiquadFilter::new(filter_type, sample_rate),
            right: BiquadFilter::new(filter_type, sample_rate),
        }
    }

    pub fn configure(&mut self, filter_type: FilterType, frequency: f64, q: f64, gain_db: f64) {
        for f in [&mut self.left, &mut self.right] {
            f.set_type(filter_type);
            f.set_frequency(frequency);
            f.set_q(q);
            f.set_gain_db(gain_db);
        }
    }

    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        (
            self.left.process(left as f64) as f32,
            self.right.process(right as f64) as f32,
        )
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }
}

/// Resonant multimode filter effect.
#[derive(Debug, Clone)]
pub struct FilterEffect {
    filter: StereoBiquad,
}

impl FilterEffect {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("mode", 0.0, 3.0, 0.0, "lp/hp/bp/notch"),
        ParamSpec::new("cutoff", 20.0, 20000.0, 1000.0, "Hz"),
        ParamSpec::new("resonance", 0.1, 20.0, 0.707, "Q"),
    ];

    pub fn new(sample_rate: f64) -> Self {
        Self {
            filter: StereoBiquad::new(FilterType::Lowpass, sample_rate),
        }
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.filter.configure(
            FilterType::from_mode(value_at(values, p, 0)),
            value_at(values, p, 1),
            value_at(values, p, 2),
            0.0,
        );
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.filter.process(*l, *r);
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }

    /// Ring-out of the resonant pole pair: 60 dB in `6.91 * Q / (pi * f)` seconds.
    pub fn tail_seconds(values: &[f64]) -> f64 {
        let p = Self::PARAMS;
        let cutoff = value_at(values, p, 1).max(1.0);
        let q = value_at(values, p, 2).max(0.1);
        6.91 * q / (PI * cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowpass_passes_dc() {
        let mut f = BiquadFilter::new(FilterType::Lowpass, 44100.0);
        f.frequency = 5000.0;
        f.update_coefficients();

        // Feed DC signal (1.0): should converge to 1.0
        let mut output = 0.0;
        for _ in 0..1000 {
            output = f.process(1.0);
        }
        assert!(
            (output - 1.0).abs() < 0.001,
            "Lowpass should pass DC, got {output}"
        );
    }

    #[test]
    fn highpass_blocks_dc() {
        let mut f = BiquadFilter::new(FilterType::Highpass, 44100.0);
        f.frequency = 1000.0;
        f.update_coefficients();

        let mut output = 0.0;
        for _ in 0..1000 {
            output = f.process(1.0);
        }
        assert!(output.abs() < 0.001, "Highpass should block DC, got {output}");
    }

    #[test]
    fn lowpass_attenuates_high_freq() {
        let mut f = BiquadFilter::new(FilterType::Lowpass, 44100.0);
        f.frequency = 200.0;
        f.q = 0.707;
        f.update_coefficients();

        let freq = 10000.0;
        let mut max_out = 0.0_f64;
        for i in 0..4410 {
            let t = i as f64 / 44100.0;
            let input = (2.0 * PI * freq * t).sin();
            let out = f.process(input);
            if i > 1000 {
                max_out = max_out.max(out.abs());
            }
        }
        assert!(
            max_out < 0.01,
            "Lowpass@200Hz should strongly attenuate 10kHz, got amplitude {max_out}"
        );
    }

    #[test]
    fn low_shelf_boosts_dc_by_gain() {
        let mut f = BiquadFilter::new(FilterType::LowShelf, 48000.0);
        f.frequency = 200.0;
        f.gain_db = 6.0;
        f.update_coefficients();
        let mut output = 0.0;
        for _ in 0..20000 {
            output = f.process(1.0);
        }
        let expected = 10.0_f64.powf(6.0 / 20.0);
        assert!((output - expected).abs() < 0.01, "got {output}, want {expected}");
    }

    #[test]
    fn allpass_keeps_dc_level() {
        let mut f = BiquadFilter::new(FilterType::Allpass, 48000.0);
        f.frequency = 500.0;
        f.update_coefficients();
        let mut output = 0.0;
        for _ in 0..20000 {
            output = f.process(1.0);
        }
        assert!((output - 1.0).abs() < 1e-3, "got {output}");
    }

    #[test]
    fn filter_output_finite() {
        let mut f = BiquadFilter::new(FilterType::Bandpass, 44100.0);
        f.frequency = 1000.0;
        f.update_coefficients();

        for i in 0..10000 {
            let input = if i % 100 == 0 { 1.0 } else { 0.0 };
            let out = f.process(input);
            assert!(out.is_finite(), "Filter output not finite at sample {i}");
        }
    }

    #[test]
    fn filter_effect_tail_grows_with_resonance() {
        let low_q = FilterEffect::tail_seconds(&[0.0, 200.0, 0.707]);
        let high_q = FilterEffect::tail_seconds(&[0.0, 200.0, 15.0]);
        assert!(high_q > low_q);
        assert!(low_q > 0.0);
    }
}
