//! Reverb effect: Schroeder-style algorithmic reverb.
//!
//! Uses parallel comb filters followed by series allpass filters,
//! based on the classic Schroeder/Moorer reverb design. Comb feedback is
//! derived from the requested decay time so that the tail falls by 60 dB
//! over `decay` seconds regardless of sample rate.

use crate::parameter::{ParamSpec, value_at};

/// A comb filter delay line with feedback.
#[derive(Debug, Clone)]
struct CombFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damp1: f32,
    damp2: f32,
    filterstore: f32,
}

impl CombFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback: 0.84,
            damp1: 0.2,
            damp2: 0.8,
            filterstore: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];

        // Lowpass in the feedback path (damping)
        self.filterstore = output * self.damp2 + self.filterstore * self.damp1;

        self.buffer[self.index] = input + self.filterstore * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();

        output
    }

    fn set_damp(&mut self, damp: f32) {
        self.damp1 = damp;
        self.damp2 = 1.0 - damp;
    }

    /// Feedback such that one trip round the loop loses `60 * len / (rt60 * sr)` dB.
    fn set_decay(&mut self, rt60: f64, sample_rate: f64) {
        let loop_seconds = self.buffer.len() as f64 / sample_rate;
        self.feedback = 10.0_f64.powf(-3.0 * loop_seconds / rt60.max(1e-3)) as f32;
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.filterstore = 0.0;
    }
}

/// An allpass filter delay line.
#[derive(Debug, Clone)]
struct AllpassFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
}

impl AllpassFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback: 0.5,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let bufout = self.buffer[self.index];
        let output = bufout - input;

        self.buffer[self.index] = input + bufout * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();

        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

// Tuning constants (scaled for 44100 Hz sample rate)
const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;
const INPUT_GAIN: f32 = 0.015;

/// A stereo algorithmic reverb using the Schroeder/Freeverb design.
///
/// Produces the wet signal only; the owning chain sums it over the dry input.
#[derive(Debug, Clone)]
pub struct Reverb {
    comb_l: Vec<CombFilter>,
    comb_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,
    sample_rate: f64,

    /// RT60 in seconds.
    pub decay: f64,
    /// Damping (0.0 to 1.0). Higher = darker sound.
    pub damping: f64,
    /// Stereo width (0.0 to 1.0).
    pub width: f64,
}

impl Reverb {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("decay", 0.1, 20.0, 2.0, "s"),
        ParamSpec::new("damping", 0.0, 0.95, 0.3, ""),
        ParamSpec::new("width", 0.0, 1.0, 1.0, ""),
    ];

    pub fn new(sample_rate: f64) -> Self {
        let scale = sample_rate / 44100.0;
        let sized = |t: usize, spread: usize| ((t as f64) * scale) as usize + spread;

        let mut reverb = Self {
            comb_l: COMB_TUNING.iter().map(|&t| CombFilter::new(sized(t, 0))).collect(),
            comb_r: COMB_TUNING
                .iter()
                .map(|&t| CombFilter::new(sized(t, STEREO_SPREAD)))
                .collect(),
            allpass_l: ALLPASS_TUNING
                .iter()
                .map(|&t| AllpassFilter::new(sized(t, 0)))
                .collect(),
            allpass_r: ALLPASS_TUNING
                .iter()
                .map(|&t| AllpassFilter::new(sized(t, STEREO_SPREAD)))
                .collect(),
            sample_rate,
            decay: 2.0,
            damping: 0.3,
            width: 1.0,
        };

        reverb.update_parameters();
        reverb
    }

    /// Create a reverb with a given decay and damping.
    pub fn with_params(sample_rate: f64, decay: f64, damping: f64) -> Self {
        let mut r = Self::new(sample_rate);
        r.set_params(&[decay, damping, 1.0]);
        r
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        let decay = value_at(values, p, 0);
        let damping = value_at(values, p, 1);
        self.width = value_at(values, p, 2);
        if decay != self.decay || damping != self.damping {
            self.decay = decay;
            self.damping = damping;
            self.update_parameters();
        }
    }

    /// Update internal parameters after changing decay or damping.
    pub fn update_parameters(&mut self) {
        let damp = self.damping as f32;
        for comb in self.comb_l.iter_mut().chain(self.comb_r.iter_mut()) {
            comb.set_decay(self.decay, self.sample_rate);
            comb.set_damp(damp);
        }
    }

    /// Process a stereo sample pair, returning the wet output.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let input = (left + right) * INPUT_GAIN;

        // Sum comb filters in parallel
        let mut out_l = 0.0f32;
        let mut out_r = 0.0f32;

        for comb in &mut self.comb_l {
            out_l += comb.process(input);
        }
        for comb in &mut self.comb_r {
            out_r += comb.process(input);
        }

        // Process through allpass filters in series
        for allpass in &mut self.allpass_l {
            out_l = allpass.process(out_l);
        }
        for allpass in &mut self.allpass_r {
            out_r = allpass.process(out_r);
        }

        let width = self.width as f32;
        let wet1 = width / 2.0 + 0.5;
        let wet2 = (1.0 - width) / 2.0;

        (out_l * wet1 + out_r * wet2, out_r * wet1 + out_l * wet2)
    }

    /// Replace a block of stereo audio with its reverberation.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process(*l, *r);
        }
    }

    /// Clear all internal buffers.
    pub fn clear(&mut self) {
        for comb in self.comb_l.iter_mut().chain(self.comb_r.iter_mut()) {
            comb.clear();
        }
        for allpass in self.allpass_l.iter_mut().chain(self.allpass_r.iter_mut()) {
            allpass.clear();
        }
    }

    pub fn tail_seconds(values: &[f64]) -> f64 {
        value_at(values, Self::PARAMS, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak_over(reverb: &mut Reverb, samples: usize) -> f32 {
        let mut peak = 0.0f32;
        for _ in 0..samples {
            let (l, r) = reverb.process(0.0, 0.0);
            peak = peak.max(l.abs().max(r.abs()));
        }
        peak
    }

    #[test]
    fn test_reverb_produces_output() {
        let mut reverb = Reverb::with_params(44100.0, 1.0, 0.5);

        reverb.process(1.0, 1.0);

        assert!(
            peak_over(&mut reverb, 5000) > 0.001,
            "Reverb should produce output after impulse"
        );
    }

    #[test]
    fn test_reverb_decays_within_rt60() {
        let sr = 48000.0;
        let decay = 1.0;
        let mut reverb = Reverb::with_params(sr, decay, 0.3);

        reverb.process(1.0, 1.0);
        let early = peak_over(&mut reverb, (0.2 * sr) as usize);
        // skip ahead to 1.25 * decay
        peak_over(&mut reverb, ((1.25 * decay - 0.2) * sr) as usize);
        let late = peak_over(&mut reverb, (0.1 * sr) as usize);

        assert!(early > 0.0);
        assert!(
            late < early * 0.01,
            "tail should be 40 dB down after 1.25 * RT60: early={early}, late={late}"
        );
    }

    #[test]
    fn test_longer_decay_rings_longer() {
        let sr = 48000.0;
        let mut short = Reverb::with_params(sr, 0.5, 0.3);
        let mut long = Reverb::with_params(sr, 4.0, 0.3);
        short.process(1.0, 1.0);
        long.process(1.0, 1.0);
        peak_over(&mut short, sr as usize);
        peak_over(&mut long, sr as usize);
        let s = peak_over(&mut short, 4800);
        let l = peak_over(&mut long, 4800);
        assert!(l > s * 10.0, "short={s}, long={l}");
    }

    #[test]
    fn test_tail_reports_decay() {
        assert_eq!(Reverb::tail_seconds(&[2.0, 0.3, 1.0]), 2.0);
        assert_eq!(Reverb::tail_seconds(&[]), 2.0);
    }

    #[test]
    fn test_clear_silences() {
        let mut reverb = Reverb::new(44100.0);
        reverb.process(1.0, 1.0);
        reverb.clear();
        assert_eq!(peak_over(&mut reverb, 4000), 0.0);
    }
}
