//! Timeline content: audio clips, MIDI notes, and the note renderer.

use crate::dsp::mixer::db_to_gain;
use crate::dsp::voice::Instrument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Decoded stereo audio at the engine sample rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipAudio {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl ClipAudio {
    /// Both channels are truncated to the shorter one.
    pub fn stereo(mut left: Vec<f32>, mut right: Vec<f32>) -> Self {
        let frames = left.len().min(right.len());
        left.truncate(frames);
        right.truncate(frames);
        Self { left, right }
    }

    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            right: samples.clone(),
            left: samples,
        }
    }

    pub fn frames(&self) -> usize {
        self.left.len().min(self.right.len())
    }
}

/// A piece of audio placed on a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    /// Timeline position of the first frame, in samples.
    pub start: u64,
    #[serde(default)]
    pub gain_db: f64,
    pub audio: Arc<ClipAudio>,
}

impl Clip {
    pub fn new(start: u64, audio: ClipAudio) -> Self {
        Self {
            start,
            gain_db: 0.0,
            audio: Arc::new(audio),
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.audio.frames() as u64
    }

    pub fn gain(&self) -> f32 {
        db_to_gain(self.gain_db) as f32
    }
}

/// One note on a MIDI track. Times are in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiNote {
    pub start: u64,
    /// Gate length.
    pub length: u64,
    pub pitch: u8,
    /// 1..=127
    pub velocity: u8,
}

impl MidiNote {
    pub fn new(start: u64, length: u64, pitch: u8, velocity: u8) -> Self {
        Self {
            start,
            length,
            pitch: pitch.min(127),
            velocity: velocity.clamp(1, 127),
        }
    }
}

/// Seeded timing and velocity jitter for MIDI playback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Humanize {
    /// Maximum timing offset either way, in milliseconds.
    pub timing_ms: f64,
    /// Maximum velocity change either way, as a fraction of the note velocity.
    pub velocity: f64,
}

impl Humanize {
    fn sanitized(self) -> Self {
        let clean = |v: f64, max: f64| if v.is_finite() { v.clamp(0.0, max) } else { 0.0 };
        Self {
            timing_ms: clean(self.timing_ms, 100.0),
            velocity: clean(self.velocity, 1.0),
        }
    }
}

/// Render a note list through `instrument`.
///
/// Returns the clip start and its audio, or `None` for an empty list. The
/// jitter stream comes from `seed` alone, so the same inputs always give the
/// same samples.
pub fn render_notes(
    notes: &[MidiNote],
    instrument: &Instrument,
    humanize: Option<Humanize>,
    seed: u64,
    sample_rate: f64,
) -> Option<(u64, ClipAudio)> {
    if notes.is_empty() {
        return None;
    }

    let mut ordered = notes.to_vec();
    ordered.sort_by_key(|n| (n.start, n.pitch));

    let mut rng = fastrand::Rng::with_seed(seed);
    let humanize = humanize.map(Humanize::sanitized);
    let max_shift = humanize.map_or(0, |h| (h.timing_ms * 0.001 * sample_rate) as i64);

    // (start, gate, pitch, velocity) after jitter
    let placed: Vec<(u64, u64, u8, f64)> = ordered
        .iter()
        .map(|n| {
            let mut start = n.start;
            let mut velocity = n.velocity as f64 / 127.0;
            if let Some(h) = humanize {
                if max_shift > 0 {
                    let shift = rng.i64(-max_shift..=max_shift);
                    start = start.saturating_add_signed(shift);
                }
                if h.velocity > 0.0 {
                    velocity *= 1.0 + (rng.f64() * 2.0 - 1.0) * h.velocity;
                }
            }
            (start, n.length.max(1), n.pitch, velocity.clamp(0.0, 1.0))
        })
        .collect();

    let origin = placed.iter().map(|p| p.0).min()?;
    let end = placed
        .iter()
        .map(|&(start, gate, ..)| start + instrument.note_frames(gate, sample_rate))
        .max()?;

    let mut samples = vec![0.0f32; (end - origin) as usize];
    let mut voice = instrument.voice(sample_rate);
    for &(start, gate, pitch, velocity) in &placed {
        let offset = (start - origin) as usize;
        voice.render_into(pitch, velocity, gate, instrument.gain, &mut samples[offset..]);
    }

    Some((origin, ClipAudio::mono(samples)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_end_and_gain() {
        let mut clip = Clip::new(100, ClipAudio::mono(vec![0.5; 50]));
        assert_eq!(clip.end(), 150);
        assert_eq!(clip.gain(), 1.0);
        clip.gain_db = -96.0;
        assert_eq!(clip.gain(), 0.0);
    }

    #[test]
    fn stereo_truncates_to_shorter_channel() {
        let audio = ClipAudio::stereo(vec![0.0; 10], vec![0.0; 7]);
        assert_eq!(audio.frames(), 7);
        assert_eq!(audio.left.len(), 7);
    }

    #[test]
    fn notes_render_from_first_start() {
        let notes = [MidiNote::new(4800, 4800, 60, 100), MidiNote::new(9600, 4800, 64, 100)];
        let (start, audio) = render_notes(&notes, &Instrument::default(), None, 0, 48000.0).unwrap();
        assert_eq!(start, 4800);
        assert!(audio.frames() >= 9600);
        assert!(audio.left.iter().any(|s| s.abs() > 0.01));
        assert_eq!(audio.left, audio.right);
    }

    #[test]
    fn humanize_is_seeded() {
        let notes: Vec<MidiNote> = (0..8).map(|i| MidiNote::new(4800 + i * 2400, 1200, 60 + i as u8, 90)).collect();
        let h = Some(Humanize {
            timing_ms: 10.0,
            velocity: 0.3,
        });
        let inst = Instrument::default();
        let a = render_notes(&notes, &inst, h, 11, 48000.0).unwrap();
        let b = render_notes(&notes, &inst, h, 11, 48000.0).unwrap();
        let c = render_notes(&notes, &inst, h, 12, 48000.0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let plain = render_notes(&notes, &inst, None, 11, 48000.0).unwrap();
        assert_ne!(a.1, plain.1);
    }

    #[test]
    fn empty_note_list_renders_nothing() {
        assert!(render_notes(&[], &Instrument::default(), None, 0, 48000.0).is_none());
    }
}
