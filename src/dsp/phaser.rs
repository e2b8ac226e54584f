//! Phaser: a cascade of first-order allpass stages swept by an LFO.
//!
//! The allpass corner sweeps between `min_freq` and `max_freq`; the cascade
//! output is fed back into its input. The wet output is the phase-shifted
//! signal only, so notches appear when the chain blends it with the dry path.

use crate::parameter::{ParamSpec, value_at};
use std::f64::consts::PI;

const STAGES: usize = 6;
const MIN_FREQ: f64 = 200.0;
const MAX_FREQ: f64 = 2000.0;

#[derive(Debug, Clone, Copy, Default)]
struct AllpassState {
    x1: f32,
    y1: f32,
}

#[derive(Debug, Clone)]
pub struct Phaser {
    sample_rate: f64,
    phase: f64,
    rate: f64,
    depth: f64,
    feedback: f32,
    stages_l: [AllpassState; STAGES],
    stages_r: [AllpassState; STAGES],
    last_l: f32,
    last_r: f32,
}

impl Phaser {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("rate", 0.05, 10.0, 0.5, "Hz"),
        ParamSpec::new("depth", 0.0, 1.0, 0.7, ""),
        ParamSpec::new("feedback", 0.0, 0.9, 0.3, ""),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let mut p = Self {
            sample_rate,
            phase: 0.0,
            rate: 0.5,
            depth: 0.7,
            feedback: 0.3,
            stages_l: [AllpassState::default(); STAGES],
            stages_r: [AllpassState::default(); STAGES],
            last_l: 0.0,
            last_r: 0.0,
        };
        p.set_params(&[]);
        p
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.rate = value_at(values, p, 0);
        self.depth = value_at(values, p, 1);
        self.feedback = value_at(values, p, 2) as f32;
    }

    #[inline]
    fn cascade(stages: &mut [AllpassState; STAGES], input: f32, alpha: f32) -> f32 {
        let mut signal = input;
        for state in stages.iter_mut() {
            let out = alpha * signal + state.x1 - alpha * state.y1;
            state.x1 = signal;
            state.y1 = out;
            signal = out;
        }
        signal
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let phase_inc = self.rate / self.sample_rate;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let lfo = (2.0 * PI * self.phase).sin() * 0.5 + 0.5;
            let freq = MIN_FREQ + self.depth * lfo * (MAX_FREQ - MIN_FREQ);
            let t = (PI * freq / self.sample_rate).tan();
            let alpha = ((t - 1.0) / (t + 1.0)) as f32;

            self.last_l = Self::cascade(&mut self.stages_l, *l + self.last_l * self.feedback, alpha);
            self.last_r = Self::cascade(&mut self.stages_r, *r + self.last_r * self.feedback, alpha);
            *l = self.last_l;
            *r = self.last_r;

            self.phase = (self.phase + phase_inc) % 1.0;
        }
    }

    pub fn reset(&mut self) {
        self.stages_l = [AllpassState::default(); STAGES];
        self.stages_r = [AllpassState::default(); STAGES];
        self.last_l = 0.0;
        self.last_r = 0.0;
        self.phase = 0.0;
    }

    /// Settle time of the feedback loop: group delay of the cascade at the
    /// lowest sweep frequency, repeated until the feedback falls 60 dB.
    pub fn tail_seconds(values: &[f64]) -> f64 {
        let feedback = value_at(values, Self::PARAMS, 2).clamp(0.0, 0.99);
        let group_delay = STAGES as f64 / (PI * MIN_FREQ);
        let trips = if feedback > 1e-3 {
            (1e-3f64.ln() / feedback.ln()).ceil()
        } else {
            1.0
        };
        group_delay * (trips + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_stays_finite_with_feedback() {
        let mut p = Phaser::new(48000.0);
        p.set_params(&[5.0, 1.0, 0.9]);
        let mut l: Vec<f32> = (0..48000).map(|i| if i % 100 == 0 { 1.0 } else { 0.0 }).collect();
        let mut r = l.clone();
        p.process_block(&mut l, &mut r);
        assert!(l.iter().all(|s| s.is_finite() && s.abs() < 100.0));
    }

    #[test]
    fn tail_grows_with_feedback() {
        assert!(Phaser::tail_seconds(&[0.5, 0.7, 0.8]) > Phaser::tail_seconds(&[0.5, 0.7, 0.1]));
        assert!(Phaser::tail_seconds(&[0.5, 0.7, 0.0]) > 0.0);
    }

    #[test]
    fn rings_after_impulse() {
        let mut p = Phaser::new(48000.0);
        let mut l = vec![0.0f32; 512];
        let mut r = l.clone();
        l[0] = 1.0;
        r[0] = 1.0;
        p.process_block(&mut l, &mut r);
        assert!(l[1..].iter().any(|s| s.abs() > 1e-4));
    }
}
