//! Compressor effect: dynamics processing for audio leveling.
//!
//! Implements a feed-forward compressor with threshold, ratio, knee,
//! attack, and release. Gain reduction follows the detector envelope
//! continuously; there is no stepping between blocks.

use crate::dsp::mixer::{db_to_gain, gain_to_db};
use crate::parameter::{ParamSpec, value_at};

/// A stereo dynamics compressor.
#[derive(Debug, Clone)]
pub struct Compressor {
    sample_rate: f64,

    /// Threshold in dB (typical: -50 to 0).
    pub threshold: f64,
    /// Compression ratio (e.g., 4.0 = 4:1 compression).
    pub ratio: f64,
    /// Knee width in dB (0 = hard knee, higher = softer transition).
    pub knee: f64,
    /// Attack time in seconds.
    pub attack: f64,
    /// Release time in seconds.
    pub release: f64,
    /// Makeup gain in dB.
    pub makeup_gain: f64,

    // Internal state
    envelope: f64, // Current envelope level (linear)
    attack_coef: f64,
    release_coef: f64,
}

impl Compressor {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("threshold", -60.0, 0.0, -24.0, "dB"),
        ParamSpec::new("ratio", 1.0, 20.0, 4.0, ":1"),
        ParamSpec::new("attack", 0.0001, 1.0, 0.003, "s"),
        ParamSpec::new("release", 0.001, 5.0, 0.25, "s"),
        ParamSpec::new("knee", 0.0, 24.0, 6.0, "dB"),
        ParamSpec::new("makeup", 0.0, 24.0, 0.0, "dB"),
    ];

    /// Create a new compressor with default settings.
    pub fn new(sample_rate: f64) -> Self {
        let mut c = Self {
            sample_rate,
            threshold: -24.0,
            ratio: 4.0,
            knee: 6.0,
            attack: 0.003,   // 3ms
            release: 0.25,   // 250ms
            makeup_gain: 0.0,
            envelope: 0.0,
            attack_coef: 0.0,
            release_coef: 0.0,
        };
        c.update_coefficients();
        c
    }

    /// Create a compressor with specific parameters.
    pub fn with_params(
        sample_rate: f64,
        threshold: f64,
        ratio: f64,
        attack: f64,
        release: f64,
    ) -> Self {
        let mut c = Self::new(sample_rate);
        c.threshold = threshold.clamp(-60.0, 0.0);
        c.ratio = ratio.clamp(1.0, 20.0);
        c.attack = attack.clamp(0.0001, 1.0);
        c.release = release.clamp(0.001, 5.0);
        c.update_coefficients();
        c
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.threshold = value_at(values, p, 0);
        self.ratio = value_at(values, p, 1).max(1.0);
        self.attack = value_at(values, p, 2);
        self.release = value_at(values, p, 3);
        self.knee = value_at(values, p, 4);
        self.makeup_gain = value_at(values, p, 5);
        self.update_coefficients();
    }

    fn update_coefficients(&mut self) {
        self.attack_coef = (-1.0 / (self.attack.max(1e-5) * self.sample_rate)).exp();
        self.release_coef = (-1.0 / (self.release.max(1e-5) * self.sample_rate)).exp();
    }

    /// Compute gain reduction for a given input level (in dB).
    #[inline]
    fn compute_gain(&self, input_db: f64) -> f64 {
        let threshold = self.threshold;
        let ratio = self.ratio;
        let knee = self.knee;

        if knee <= 0.0 {
            // Hard knee
            if input_db <= threshold {
                0.0 // No gain reduction
            } else {
                // Gain reduction = (input - threshold) * (1 - 1/ratio)
                (threshold - input_db) * (1.0 - 1.0 / ratio)
            }
        } else {
            // Soft knee
            let half_knee = knee / 2.0;
            let knee_start = threshold - half_knee;
            let knee_end = threshold + half_knee;

            if input_db <= knee_start {
                0.0 // Below knee, no compression
            } else if input_db >= knee_end {
                // Above knee, full compression
                (threshold - input_db) * (1.0 - 1.0 / ratio)
            } else {
                // In the knee region - quadratic interpolation
                let x = input_db - knee_start;
                let knee_factor = x / knee;
                -knee_factor * knee_factor * (1.0 - 1.0 / ratio) * half_knee
            }
        }
    }

    /// Process a stereo sample pair.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        // Compute input level (peak of L/R)
        let input_level = (left.abs()).max(right.abs()) as f64;

        // Envelope follower (peak detection with attack/release)
        let coef = if input_level > self.envelope {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope = coef * self.envelope + (1.0 - coef) * input_level;

        let envelope_db = gain_to_db(self.envelope);

        // Compute gain reduction
        let gain_reduction_db = self.compute_gain(envelope_db);

        // Apply makeup gain and convert to linear
        let total_gain_db = gain_reduction_db + self.makeup_gain;
        let gain = db_to_gain(total_gain_db) as f32;

        (left * gain, right * gain)
    }

    /// Process a block of stereo audio in-place.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process(*l, *r);
        }
    }

    /// Reset the compressor state.
    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }

    /// Current gain reduction in dB (for metering).
    pub fn gain_reduction_db(&self) -> f64 {
        -self.compute_gain(gain_to_db(self.envelope))
    }
}
