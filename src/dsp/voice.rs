//! Voice: a single note instance combining oscillator + envelope.

use serde::{Deserialize, Serialize};

use super::envelope::{Adsr, Envelope};
use super::oscillator::{Oscillator, Waveform, midi_to_frequency};

/// The built-in synthesiser a MIDI track plays through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrument {
    pub waveform: Waveform,
    pub envelope: Adsr,
    /// Detune in cents.
    pub detune: f64,
    /// Output level per voice, linear.
    pub gain: f64,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            waveform: Waveform::Triangle,
            envelope: Adsr::default(),
            detune: 0.0,
            gain: 0.3,
        }
    }
}

impl Instrument {
    pub fn voice(&self, sample_rate: f64) -> Voice {
        let mut oscillator = Oscillator::new(self.waveform, sample_rate);
        oscillator.detune = self.detune;
        Voice {
            oscillator,
            envelope: Envelope::new(self.envelope, sample_rate),
            velocity: 1.0,
            finished: true,
        }
    }

    /// Frames of audio a note held for `gate_frames` produces, release included.
    pub fn note_frames(&self, gate_frames: u64, sample_rate: f64) -> u64 {
        let release = self.envelope.sanitized().release;
        gate_frames + (release * sample_rate).ceil() as u64 + 1
    }
}

/// A single voice: one oscillator shaped by an ADSR envelope.
#[derive(Debug, Clone)]
pub struct Voice {
    pub oscillator: Oscillator,
    pub envelope: Envelope,
    /// Velocity gain [0, 1].
    pub velocity: f64,
    finished: bool,
}

impl Voice {
    /// Start playing a MIDI note.
    pub fn note_on(&mut self, note: u8, velocity: f64) {
        self.oscillator.frequency = midi_to_frequency(note);
        self.oscillator.reset();
        self.velocity = velocity.clamp(0.0, 1.0);
        self.finished = false;
        self.envelope.gate_on();
    }

    pub fn note_off(&mut self) {
        self.envelope.gate_off();
    }

    /// Generate the next sample.
    pub fn next_sample(&mut self) -> f64 {
        if self.finished {
            return 0.0;
        }

        let osc = self.oscillator.next_sample();
        let env = self.envelope.next_sample();

        if self.envelope.is_finished() {
            self.finished = true;
        }

        osc * env * self.velocity
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Play a whole note: gate held for `gate_frames`, then released until silent.
    /// Samples are added into `out`, which bounds the rendered length.
    pub fn render_into(&mut self, note: u8, velocity: f64, gate_frames: u64, gain: f64, out: &mut [f32]) {
        self.note_on(note, velocity);
        for (i, s) in out.iter_mut().enumerate() {
            if i as u64 == gate_frames {
                self.note_off();
            }
            if self.is_finished() {
                break;
            }
            *s += (self.next_sample() * gain) as f32;
        }
    }
}
