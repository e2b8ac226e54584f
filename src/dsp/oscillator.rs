//! Anti-aliased oscillators using PolyBLEP.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Supported waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    #[serde(alias = "saw")]
    Sawtooth,
    #[default]
    Triangle,
}

/// Equal-tempered frequency of a MIDI note number (A4 = 69 = 440 Hz).
pub fn midi_to_frequency(note: u8) -> f64 {
    440.0 * 2.0_f64.powf((note as f64 - 69.0) / 12.0)
}

/// A band-limited oscillator with anti-aliasing (PolyBLEP).
#[derive(Debug, Clone)]
pub struct Oscillator {
    pub waveform: Waveform,
    pub frequency: f64,
    pub detune: f64, // in cents
    phase: f64,
    sample_rate: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, sample_rate: f64) -> Self {
        Oscillator {
            waveform,
            frequency: 440.0,
            detune: 0.0,
            phase: 0.0,
            sample_rate,
        }
    }

    /// Effective frequency accounting for detune (in cents).
    fn effective_freq(&self) -> f64 {
        self.frequency * (2.0_f64).powf(self.detune / 1200.0)
    }

    /// Phase increment per sample.
    fn phase_inc(&self) -> f64 {
        self.effective_freq() / self.sample_rate
    }

    /// Generate the next sample.
    pub fn next_sample(&mut self) -> f64 {
        let inc = self.phase_inc();
        let sample = match self.waveform {
            Waveform::Sine => self.sine(),
            Waveform::Sawtooth => self.sawtooth(inc),
            Waveform::Square => self.square(inc),
            Waveform::Triangle => self.triangle(),
        };

        self.phase += inc;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        sample
    }

    fn sine(&self) -> f64 {
        (2.0 * PI * self.phase).sin()
    }

    /// Naive sawtooth: rises from -1 to +1, then drops.
    /// PolyBLEP corrects the discontinuity at the wrap.
    fn sawtooth(&self, inc: f64) -> f64 {
        let naive = 2.0 * self.phase - 1.0;
        naive - poly_blep(self.phase, inc)
    }

    /// Square wave via two sawtooth waves with PolyBLEP.
    fn square(&self, inc: f64) -> f64 {
        let mut value = if self.phase < 0.5 { 1.0 } else { -1.0 };
        value += poly_blep(self.phase, inc);
        value -= poly_blep((self.phase + 0.5) % 1.0, inc);
        value
    }

    /// Piecewise-linear triangle: -1 to +1 over the first half cycle, back down over the second.
    fn triangle(&self) -> f64 {
        if self.phase < 0.5 {
            4.0 * self.phase - 1.0
        } else {
            3.0 - 4.0 * self.phase
        }
    }

    /// Reset oscillator phase.
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// PolyBLEP (Polynomial Band-Limited Step) anti-aliasing correction.
///
/// `t` is the phase [0, 1), `dt` is the phase increment per sample.
/// Returns a correction value to subtract from the naive waveform
/// at discontinuities.
fn poly_blep(t: f64, dt: f64) -> f64 {
    if t < dt {
        // Just after the discontinuity
        let t = t / dt;
        2.0 * t - t * t - 1.0
    } else if t > 1.0 - dt {
        // Just before the next discontinuity
        let t = (t - 1.0) / dt;
        t * t + 2.0 * t + 1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_zero_at_start() {
        let mut osc = Oscillator::new(Waveform::Sine, 44100.0);
        osc.frequency = 440.0;
        let sample = osc.next_sample();
        assert!(sample.abs() < 1e-10, "Sine should start near 0, got {sample}");
    }

    #[test]
    fn sine_range() {
        let mut osc = Oscillator::new(Waveform::Sine, 44100.0);
        osc.frequency = 440.0;
        for _ in 0..44100 {
            let s = osc.next_sample();
            assert!(s >= -1.0 && s <= 1.0, "Sine out of range: {s}");
        }
    }

    #[test]
    fn sawtooth_range() {
        let mut osc = Oscillator::new(Waveform::Sawtooth, 44100.0);
        osc.frequency = 440.0;
        for _ in 0..44100 {
            let s = osc.next_sample();
            assert!(s >= -1.5 && s <= 1.5, "Saw out of range: {s}");
        }
    }

    #[test]
    fn square_range() {
        let mut osc = Oscillator::new(Waveform::Square, 44100.0);
        osc.frequency = 440.0;
        for _ in 0..44100 {
            let s = osc.next_sample();
            assert!(s >= -1.5 && s <= 1.5, "Square out of range: {s}");
        }
    }

    #[test]
    fn triangle_range() {
        let mut osc = Oscillator::new(Waveform::Triangle, 44100.0);
        osc.frequency = 440.0;
        for _ in 0..44100 {
            let s = osc.next_sample();
            assert!(s >= -1.0 && s <= 1.0, "Triangle out of range: {s}");
        }
    }

    #[test]
    fn midi_note_frequencies() {
        assert!((midi_to_frequency(69) - 440.0).abs() < 1e-9);
        assert!((midi_to_frequency(81) - 880.0).abs() < 1e-9);
        assert!((midi_to_frequency(60) - 261.6256).abs() < 1e-3);
    }

    #[test]
    fn waveform_names_parse() {
        let w: Waveform = serde_json::from_str("\"saw\"").unwrap();
        assert_eq!(w, Waveform::Sawtooth);
        assert_eq!(serde_json::to_string(&Waveform::Sine).unwrap(), "\"sine\"");
    }

    #[test]
    fn detune_shifts_frequency() {
        let mut osc1 = Oscillator::new(Waveform::Sine, 44100.0);
        osc1.frequency = 440.0;
        osc1.detune = 0.0;

        let mut osc2 = Oscillator::new(Waveform::Sine, 44100.0);
        osc2.frequency = 440.0;
        osc2.detune = 1200.0; // +1 octave

        // osc2 should complete one cycle in half the samples
        let inc1 = osc1.phase_inc();
        let inc2 = osc2.phase_inc();
        assert!(
            (inc2 - 2.0 * inc1).abs() < 1e-10,
            "1200 cents detune should double frequency"
        );
    }
}
