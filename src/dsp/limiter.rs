//! Brick-wall lookahead peak limiter.
//!
//! 1. Each input frame is written to a ring-buffer delay line.
//! 2. The stereo peak is compared against the ceiling and a per-frame
//!    target gain is stored in a parallel ring.
//! 3. A sliding-window minimum over the lookahead window finds the lowest
//!    target gain among frames still in the delay line.
//! 4. The gain follows that minimum: the attack converges 99 % within the
//!    lookahead, the release is a first-order exponential.
//! 5. The delayed frame is scaled by the gain and hard-limited to the
//!    ceiling, so no output sample ever exceeds it.
//!
//! All rings are sized at construction; processing never allocates.

use crate::dsp::mixer::db_to_gain;
use crate::parameter::{ParamSpec, value_at};

/// Lookahead time in seconds (72 frames at 48 kHz).
pub const LOOKAHEAD_SECONDS: f64 = 0.0015;

#[derive(Debug, Clone)]
pub struct Limiter {
    ceiling: f32,
    lookahead: usize,
    sample_rate: f64,

    delay_l: Vec<f32>,
    delay_r: Vec<f32>,
    target_gains: Vec<f32>,
    write_pos: usize,

    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl Limiter {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("ceiling", -24.0, 0.0, -0.3, "dB"),
        ParamSpec::new("release", 0.01, 1.0, 0.1, "s"),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let lookahead = Self::lookahead_frames(sample_rate);
        let ring = lookahead + 1;
        let mut limiter = Self {
            ceiling: 1.0,
            lookahead,
            sample_rate,
            delay_l: vec![0.0; ring],
            delay_r: vec![0.0; ring],
            target_gains: vec![1.0; ring],
            write_pos: 0,
            gain: 1.0,
            // coeff^N = 0.01  ->  coeff = exp(ln 0.01 / N)
            attack_coeff: (-4.605_17 / lookahead as f32).exp(),
            release_coeff: 0.0,
        };
        limiter.set_params(&[]);
        limiter
    }

    pub fn lookahead_frames(sample_rate: f64) -> usize {
        ((LOOKAHEAD_SECONDS * sample_rate).round() as usize).max(1)
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.ceiling = db_to_gain(value_at(values, p, 0)) as f32;
        let release = value_at(values, p, 1).max(1e-3);
        self.release_coeff = (-1.0 / (release * self.sample_rate)).exp() as f32;
    }

    /// Latency in frames introduced by the lookahead.
    pub fn latency_frames(&self) -> usize {
        self.lookahead
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let ring = self.delay_l.len();
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = l.abs().max(r.abs());
            self.target_gains[self.write_pos] = if peak > self.ceiling {
                self.ceiling / peak
            } else {
                1.0
            };
            self.delay_l[self.write_pos] = *l;
            self.delay_r[self.write_pos] = *r;

            let min_gain = self.window_min_gain();
            let coeff = if min_gain < self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = self.gain * coeff + min_gain * (1.0 - coeff);

            let read_pos = (self.write_pos + ring - self.lookahead) % ring;
            let ceiling = self.ceiling;
            *l = (self.delay_l[read_pos] * self.gain).clamp(-ceiling, ceiling);
            *r = (self.delay_r[read_pos] * self.gain).clamp(-ceiling, ceiling);

            self.write_pos = (self.write_pos + 1) % ring;
        }
    }

    /// Minimum target gain over every frame still waiting in the delay line.
    #[inline]
    fn window_min_gain(&self) -> f32 {
        self.target_gains.iter().fold(1.0_f32, |m, &g| m.min(g))
    }

    pub fn reset(&mut self) {
        self.delay_l.fill(0.0);
        self.delay_r.fill(0.0);
        self.target_gains.fill(1.0);
        self.write_pos = 0;
        self.gain = 1.0;
    }

    /// The delay line keeps emitting for one lookahead after input stops.
    pub fn tail_seconds(_values: &[f64]) -> f64 {
        LOOKAHEAD_SECONDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(limiter: &mut Limiter, level_l: f32, level_r: f32, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut l = vec![level_l; frames];
        let mut r = vec![level_r; frames];
        limiter.process_block(&mut l, &mut r);
        (l, r)
    }

    #[test]
    fn test_below_ceiling_is_transparent() {
        let mut limiter = Limiter::new(48000.0);
        run(&mut limiter, 0.0, 0.0, 128);

        let (l, r) = run(&mut limiter, 0.4, -0.4, 256);
        for i in limiter.latency_frames()..256 {
            assert!((l[i] - 0.4).abs() < 1e-5, "left[{i}] = {}", l[i]);
            assert!((r[i] + 0.4).abs() < 1e-5, "right[{i}] = {}", r[i]);
        }
    }

    #[test]
    fn test_no_sample_exceeds_ceiling() {
        let mut limiter = Limiter::new(48000.0);
        limiter.set_params(&[-6.0, 0.1]);
        let ceiling = db_to_gain(-6.0) as f32;

        let mut l: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.07).sin() * 2.0).collect();
        let mut r = l.clone();
        limiter.process_block(&mut l, &mut r);
        assert!(l.iter().chain(r.iter()).all(|s| s.abs() <= ceiling + 1e-6));
    }

    #[test]
    fn test_gain_recovers_after_transient() {
        let mut limiter = Limiter::new(48000.0);
        run(&mut limiter, 0.0, 0.0, 128);
        run(&mut limiter, 2.0, 2.0, 32);

        // 300 ms is three release time constants
        let (l, _) = run(&mut limiter, 0.3, 0.3, 14400);
        assert!(l[14399] > 0.27, "gain didn't recover: {}", l[14399]);
    }

    #[test]
    fn test_latency() {
        assert_eq!(Limiter::new(48000.0).latency_frames(), 72);
    }
}
