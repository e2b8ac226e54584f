//! Chorus effect: stereo modulated delay for thickening sound.
//!
//! Uses an LFO-modulated delay line to create subtle pitch variations
//! that produce a rich, "doubled" sound.

use crate::parameter::{ParamSpec, value_at};
use std::f64::consts::PI;

/// A stereo chorus effect with configurable rate and depth.
///
/// Output is the modulated (wet) voice only.
#[derive(Debug, Clone)]
pub struct Chorus {
    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
    phase_l: f64,
    phase_r: f64,

    /// LFO rate in Hz (typical: 0.5-5 Hz).
    pub rate: f64,
    /// Modulation depth in seconds (typical: 0.001-0.005).
    pub depth: f64,
    /// Base delay time in seconds (typical: 0.01-0.03).
    pub delay: f64,
    /// Stereo spread as the LFO phase offset between L/R in cycles (0.0-0.5).
    pub spread: f64,
}

impl Chorus {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("rate", 0.1, 10.0, 1.5, "Hz"),
        ParamSpec::new("depth", 0.0, 0.01, 0.002, "s"),
        ParamSpec::new("delay", 0.005, 0.03, 0.015, "s"),
        ParamSpec::new("spread", 0.0, 0.5, 0.25, "cycles"),
    ];

    /// Create a new chorus effect.
    pub fn new(sample_rate: f64) -> Self {
        // Buffer size: max delay + max depth + margin
        let max_delay = 0.05; // 50ms max
        let buffer_size = (sample_rate * max_delay) as usize + 1;

        Self {
            buffer_l: vec![0.0; buffer_size],
            buffer_r: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            phase_l: 0.0,
            phase_r: 0.25, // 90° phase offset for stereo spread
            rate: 1.5,
            depth: 0.002,
            delay: 0.015,
            spread: 0.25,
        }
    }

    /// Create a chorus with specific parameters.
    pub fn with_params(sample_rate: f64, rate: f64, depth: f64) -> Self {
        let mut c = Self::new(sample_rate);
        c.rate = rate.clamp(0.1, 10.0);
        c.depth = depth.clamp(0.0, 0.01);
        c
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.rate = value_at(values, p, 0);
        self.depth = value_at(values, p, 1);
        self.delay = value_at(values, p, 2);
        let spread = value_at(values, p, 3);
        if spread != self.spread {
            self.spread = spread;
            self.phase_r = (self.phase_l + spread) % 1.0;
        }
    }

    /// Longest a sample can stay in the modulated line.
    pub fn tail_seconds(values: &[f64]) -> f64 {
        let p = Self::PARAMS;
        value_at(values, p, 2) + value_at(values, p, 1)
    }

    /// Read from the delay buffer with fractional (linear interpolation) delay.
    #[inline]
    fn read_interpolated(buffer: &[f32], write_pos: usize, delay_samples: f64) -> f32 {
        let buffer_len = buffer.len();
        let delay_int = delay_samples as usize;
        let frac = (delay_samples - delay_int as f64) as f32;

        let read_pos_0 = if write_pos >= delay_int {
            write_pos - delay_int
        } else {
            buffer_len - (delay_int - write_pos)
        };

        let read_pos_1 = if read_pos_0 == 0 {
            buffer_len - 1
        } else {
            read_pos_0 - 1
        };

        let s0 = buffer[read_pos_0];
        let s1 = buffer[read_pos_1];

        // Linear interpolation
        s0 + frac * (s1 - s0)
    }

    /// Process a stereo sample pair.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let buffer_len = self.buffer_l.len();

        // Write input to buffers
        self.buffer_l[self.write_pos] = left;
        self.buffer_r[self.write_pos] = right;

        // Calculate modulated delay times
        let lfo_l = (2.0 * PI * self.phase_l).sin();
        let lfo_r = (2.0 * PI * self.phase_r).sin();

        let delay_l = (self.delay + self.depth * lfo_l) * self.sample_rate;
        let delay_r = (self.delay + self.depth * lfo_r) * self.sample_rate;

        // Clamp delay to buffer bounds
        let max_delay = (buffer_len - 1) as f64;
        let delay_l = delay_l.clamp(1.0, max_delay);
        let delay_r = delay_r.clamp(1.0, max_delay);

        // Read delayed samples with interpolation
        let wet_l = Self::read_interpolated(&self.buffer_l, self.write_pos, delay_l);
        let wet_r = Self::read_interpolated(&self.buffer_r, self.write_pos, delay_r);

        // Advance write position
        self.write_pos = (self.write_pos + 1) % buffer_len;

        // Advance LFO phases
        let phase_inc = self.rate / self.sample_rate;
        self.phase_l = (self.phase_l + phase_inc) % 1.0;
        self.phase_r = (self.phase_r + phase_inc) % 1.0;

        (wet_l, wet_r)
    }

    /// Replace a block of stereo audio with the modulated voice.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process(*l, *r);
        }
    }

    /// Clear internal buffers.
    pub fn clear(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
        self.phase_l = 0.0;
        self.phase_r = self.spread;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chorus_delays_input() {
        let mut chorus = Chorus::with_params(44100.0, 1.5, 0.0);

        // depth 0: a plain 15ms delay
        let (first, _) = chorus.process(1.0, 1.0);
        assert!(first.abs() < 1e-6);
        let mut arrived = false;
        for _ in 0..2000 {
            let (out_l, _) = chorus.process(0.0, 0.0);
            if out_l > 0.4 {
                arrived = true;
            }
        }
        assert!(arrived, "impulse should come out of the delay line");
    }

    #[test]
    fn test_chorus_produces_modulated_output() {
        let mut chorus = Chorus::with_params(44100.0, 2.0, 0.003);

        let outputs: Vec<f32> = (0..4410).map(|_| chorus.process(1.0, 1.0).0).collect();

        // Skip the initial delay period
        let later = &outputs[1000..];
        let min = later.iter().fold(f32::MAX, |m, &s| m.min(s));
        let max = later.iter().fold(f32::MIN, |m, &s| m.max(s));
        assert!(
            (max - min).abs() < 0.5,
            "Chorus output should be relatively stable but modulated"
        );
    }

    #[test]
    fn test_chorus_stereo_spread() {
        let mut chorus = Chorus::new(44100.0);

        let mut found_difference = false;
        for i in 0..4410 {
            let x = (i as f32 * 0.05).sin();
            let (out_l, out_r) = chorus.process(x, x);
            if (out_l - out_r).abs() > 0.001 {
                found_difference = true;
                break;
            }
        }

        assert!(
            found_difference,
            "Chorus should produce stereo difference due to phase offset"
        );
    }

    #[test]
    fn test_tail_is_delay_plus_depth() {
        let tail = Chorus::tail_seconds(&[1.0, 0.004, 0.02, 0.25]);
        assert!((tail - 0.024).abs() < 1e-12);
    }
}
