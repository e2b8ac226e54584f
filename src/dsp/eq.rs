//! Three-band parametric EQ: low shelf, peaking mid, high shelf.
//!
//! The shelf corners are the band crossover frequencies. All bands are
//! cookbook biquads in series.

use crate::dsp::filter::{FilterType, StereoBiquad};
use crate::parameter::{ParamSpec, value_at};

/// Shelf slope, S = 1 expressed as Q.
const SHELF_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone)]
pub struct Equalizer {
    low: StereoBiquad,
    mid: StereoBiquad,
    high: StereoBiquad,
}

impl Equalizer {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("low_freq", 20.0, 1000.0, 120.0, "Hz"),
        ParamSpec::new("low_gain", -24.0, 24.0, 0.0, "dB"),
        ParamSpec::new("mid_freq", 100.0, 10000.0, 1000.0, "Hz"),
        ParamSpec::new("mid_gain", -24.0, 24.0, 0.0, "dB"),
        ParamSpec::new("mid_q", 0.1, 10.0, 0.707, "Q"),
        ParamSpec::new("high_freq", 1000.0, 20000.0, 8000.0, "Hz"),
        ParamSpec::new("high_gain", -24.0, 24.0, 0.0, "dB"),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let mut eq = Self {
            low: StereoBiquad::new(FilterType::LowShelf, sample_rate),
            mid: StereoBiquad::new(FilterType::Peaking, sample_rate),
            high: StereoBiquad::new(FilterType::HighShelf, sample_rate),
        };
        eq.set_params(&[]);
        eq
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let v = |i| value_at(values, Self::PARAMS, i);
        self.low.configure(FilterType::LowShelf, v(0), SHELF_Q, v(1));
        self.mid.configure(FilterType::Peaking, v(2), v(4), v(3));
        self.high.configure(FilterType::HighShelf, v(5), SHELF_Q, v(6));
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (a, b) = self.low.process(*l, *r);
            let (a, b) = self.mid.process(a, b);
            (*l, *r) = self.high.process(a, b);
        }
    }

    pub fn reset(&mut self) {
        self.low.reset();
        self.mid.reset();
        self.high.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::mixer::rms;
    use std::f32::consts::PI;

    fn sine_rms(eq: &mut Equalizer, freq: f32, sr: f32) -> f64 {
        let n = sr as usize / 2;
        let mut l: Vec<f32> = (0..n).map(|i| (2.0 * PI * freq * i as f32 / sr).sin()).collect();
        let mut r = l.clone();
        eq.process_block(&mut l, &mut r);
        rms(&l[n / 2..], &r[n / 2..])
    }

    #[test]
    fn flat_settings_are_transparent() {
        let mut eq = Equalizer::new(48000.0);
        let out = sine_rms(&mut eq, 1000.0, 48000.0);
        assert!((out - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.01, "rms {out}");
    }

    #[test]
    fn mid_boost_raises_centre_frequency() {
        let mut eq = Equalizer::new(48000.0);
        eq.set_params(&[120.0, 0.0, 1000.0, 12.0, 1.0, 8000.0, 0.0]);
        let out = sine_rms(&mut eq, 1000.0, 48000.0);
        let gain_db = 20.0 * (out / std::f64::consts::FRAC_1_SQRT_2).log10();
        assert!((gain_db - 12.0).abs() < 0.5, "gain {gain_db} dB");
    }

    #[test]
    fn low_cut_leaves_highs_alone() {
        let mut eq = Equalizer::new(48000.0);
        eq.set_params(&[200.0, -18.0, 1000.0, 0.0, 0.707, 8000.0, 0.0]);
        let low = sine_rms(&mut eq, 40.0, 48000.0);
        eq.reset();
        let high = sine_rms(&mut eq, 4000.0, 48000.0);
        assert!(low < 0.2, "low band should be cut: {low}");
        assert!((high - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.03, "high {high}");
    }
}
