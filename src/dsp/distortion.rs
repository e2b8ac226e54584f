//! Waveshaping distortion.
//!
//! Transfer functions, applied to `x * drive`:
//! - soft: `tanh(y)`
//! - hard: `clamp(y, -1, 1)`
//! - fold: `sin(y)` wavefolding
//!
//! followed by a one-pole tone lowpass and an output trim. Stateless apart
//! from the tone filter, so the tail is zero.

use crate::dsp::mixer::db_to_gain;
use crate::parameter::{ParamSpec, value_at};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Soft,
    Hard,
    Fold,
}

impl Shape {
    fn from_param(v: f64) -> Self {
        match v.round() as i64 {
            1 => Shape::Hard,
            2 => Shape::Fold,
            _ => Shape::Soft,
        }
    }

    #[inline]
    pub fn apply(self, y: f32) -> f32 {
        match self {
            Shape::Soft => y.tanh(),
            Shape::Hard => y.clamp(-1.0, 1.0),
            Shape::Fold => y.sin(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Distortion {
    sample_rate: f64,
    shape: Shape,
    drive: f32,
    output: f32,
    tone_coeff: f32,
    state_l: f32,
    state_r: f32,
}

impl Distortion {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("drive", 1.0, 100.0, 4.0, "x"),
        ParamSpec::new("shape", 0.0, 2.0, 0.0, "soft/hard/fold"),
        ParamSpec::new("tone", 200.0, 20000.0, 12000.0, "Hz"),
        ParamSpec::new("output", -24.0, 6.0, 0.0, "dB"),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let mut d = Self {
            sample_rate,
            shape: Shape::Soft,
            drive: 1.0,
            output: 1.0,
            tone_coeff: 0.0,
            state_l: 0.0,
            state_r: 0.0,
        };
        d.set_params(&[]);
        d
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.drive = value_at(values, p, 0) as f32;
        self.shape = Shape::from_param(value_at(values, p, 1));
        let tone = value_at(values, p, 2).min(self.sample_rate * 0.49);
        self.tone_coeff = (-2.0 * PI * tone / self.sample_rate).exp() as f32;
        self.output = db_to_gain(value_at(values, p, 3)) as f32;
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let a = self.tone_coeff;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let yl = self.shape.apply(*l * self.drive);
            let yr = self.shape.apply(*r * self.drive);
            self.state_l = yl + a * (self.state_l - yl);
            self.state_r = yr + a * (self.state_r - yr);
            *l = self.state_l * self.output;
            *r = self.state_r * self.output;
        }
    }

    pub fn reset(&mut self) {
        self.state_l = 0.0;
        self.state_r = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_shape_is_bounded() {
        let mut d = Distortion::new(48000.0);
        d.set_params(&[100.0, 0.0, 20000.0, 0.0]);
        let mut l: Vec<f32> = (0..480).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut r = l.clone();
        d.process_block(&mut l, &mut r);
        assert!(l.iter().all(|s| s.abs() <= 1.0 + 1e-6));
    }

    #[test]
    fn hard_shape_clips_at_unity() {
        assert_eq!(Shape::Hard.apply(3.0), 1.0);
        assert_eq!(Shape::Hard.apply(-3.0), -1.0);
        assert_eq!(Shape::Hard.apply(0.25), 0.25);
    }

    #[test]
    fn silence_in_silence_out() {
        let mut d = Distortion::new(48000.0);
        let mut l = vec![0.0f32; 256];
        let mut r = l.clone();
        d.process_block(&mut l, &mut r);
        assert!(l.iter().chain(r.iter()).all(|&s| s == 0.0));
    }
}
