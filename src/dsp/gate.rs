//! Noise gate with attack, hold and release.
//!
//! A peak detector opens the gate when the input rises above the threshold.
//! The gate gain then moves toward 1 with the attack time constant and back
//! toward 0 with the release time constant once the input has stayed below
//! the threshold for the hold time.

use crate::dsp::mixer::db_to_gain;
use crate::parameter::{ParamSpec, value_at};

#[derive(Debug, Clone)]
pub struct Gate {
    sample_rate: f64,
    threshold: f32,
    attack_coeff: f32,
    release_coeff: f32,
    hold_frames: usize,

    gain: f32,
    held: usize,
}

impl Gate {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("threshold", -96.0, 0.0, -40.0, "dB"),
        ParamSpec::new("attack", 0.0001, 0.1, 0.001, "s"),
        ParamSpec::new("hold", 0.0, 1.0, 0.01, "s"),
        ParamSpec::new("release", 0.001, 2.0, 0.1, "s"),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let mut gate = Self {
            sample_rate,
            threshold: 0.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            hold_frames: 0,
            gain: 0.0,
            held: 0,
        };
        gate.set_params(&[]);
        gate
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        let sr = self.sample_rate;
        let coeff = |t: f64| (-1.0 / (t.max(1e-5) * sr)).exp() as f32;
        self.threshold = db_to_gain(value_at(values, p, 0)) as f32;
        self.attack_coeff = coeff(value_at(values, p, 1));
        self.hold_frames = (value_at(values, p, 2) * sr) as usize;
        self.release_coeff = coeff(value_at(values, p, 3));
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let level = l.abs().max(r.abs());
            let target = if level > self.threshold {
                self.held = self.hold_frames;
                1.0
            } else if self.held > 0 {
                self.held -= 1;
                1.0
            } else {
                0.0
            };

            let coeff = if target > self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = coeff * self.gain + (1.0 - coeff) * target;

            *l *= self.gain;
            *r *= self.gain;
        }
    }

    pub fn reset(&mut self) {
        self.gain = 0.0;
        self.held = 0;
    }

    /// Output is gated input, so nothing remains once the input is silent.
    /// The release is still reported to cover the fade of the last note.
    pub fn tail_seconds(values: &[f64]) -> f64 {
        let p = Self::PARAMS;
        value_at(values, p, 2) + value_at(values, p, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_signal_is_silenced() {
        let mut gate = Gate::new(48000.0);
        gate.set_params(&[-20.0, 0.001, 0.0, 0.01]);
        let mut l = vec![0.01f32; 4800];
        let mut r = l.clone();
        gate.process_block(&mut l, &mut r);
        assert!(l[4799].abs() < 1e-6);
    }

    #[test]
    fn loud_signal_opens_and_release_closes() {
        let mut gate = Gate::new(48000.0);
        gate.set_params(&[-20.0, 0.001, 0.005, 0.02]);

        let mut l = vec![0.5f32; 4800];
        let mut r = l.clone();
        gate.process_block(&mut l, &mut r);
        assert!((l[4799] - 0.5).abs() < 1e-3, "gate should be open: {}", l[4799]);

        // drop below threshold: hold then release
        let mut l = vec![0.05f32; 9600];
        let mut r = l.clone();
        gate.process_block(&mut l, &mut r);
        assert!((l[100] - 0.05).abs() < 1e-3, "still held: {}", l[100]);
        assert!(l[9599] < 0.05 * 0.01, "should have released: {}", l[9599]);
    }

    #[test]
    fn tail_is_hold_plus_release() {
        assert!((Gate::tail_seconds(&[-40.0, 0.001, 0.05, 0.2]) - 0.25).abs() < 1e-12);
    }
}
