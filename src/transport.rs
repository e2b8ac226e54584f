//! Transport: the clock shared by the host and the real-time context.
//!
//! All state lives in atomics. The host writes requests (play, stop, seek)
//! and the real-time side applies them when the next quantum starts, so a
//! change never lands in the middle of a buffer.

use crate::project::TransportSettings;
use crate::types::TimeSignature;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

pub const MIN_BPM: f64 = 20.0;
pub const MAX_BPM: f64 = 999.0;

const NO_SEEK: u64 = u64::MAX;

pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() { bpm.clamp(MIN_BPM, MAX_BPM) } else { 120.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

impl PlayState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PlayState::Playing,
            2 => PlayState::Paused,
            _ => PlayState::Stopped,
        }
    }
}

/// One contiguous run of timeline samples inside a quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// Timeline position of the first frame.
    pub position: u64,
    /// Offset into the quantum's output.
    pub offset: usize,
    pub frames: usize,
}

/// A quantum's timeline: one segment, plus one more each time the loop wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantumPlan {
    position: u64,
    frames: usize,
    /// `(start, end)` when the loop applies to this quantum.
    looping: Option<(u64, u64)>,
    /// Set when the loop wrapped during this quantum.
    pub wrapped: bool,
}

impl QuantumPlan {
    pub fn segments(&self) -> Segments {
        Segments {
            position: self.position,
            offset: 0,
            remaining: self.frames,
            looping: self.looping,
            wraps: 0,
        }
    }

    /// Where playback resumes after a wrap.
    pub fn loop_start(&self) -> Option<u64> {
        self.looping.map(|(start, _)| start)
    }
}

/// Walks a quantum without allocating, splitting at every loop end.
#[derive(Debug, Clone)]
pub struct Segments {
    position: u64,
    offset: usize,
    remaining: usize,
    looping: Option<(u64, u64)>,
    wraps: u32,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        // position < end holds whenever looping is set
        let frames = match self.looping {
            Some((_, end)) => self.remaining.min((end - self.position) as usize),
            None => self.remaining,
        };
        let segment = Segment {
            position: self.position,
            offset: self.offset,
            frames,
        };
        self.offset += frames;
        self.remaining -= frames;
        self.position += frames as u64;
        if let Some((start, end)) = self.looping {
            if self.position == end {
                self.position = start;
                self.wraps += 1;
            }
        }
        Some(segment)
    }
}

#[derive(Debug)]
pub struct Transport {
    sample_rate: f64,
    state: AtomicU8,
    recording: AtomicBool,
    position: AtomicU64,
    pending_seek: AtomicU64,
    /// Where the last `play` started; `stop` returns here.
    play_start: AtomicU64,
    bpm: AtomicU64,
    meter: AtomicU64,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    loop_enabled: AtomicBool,
}

impl Transport {
    pub fn new(sample_rate: f64, settings: &TransportSettings) -> Self {
        let transport = Self {
            sample_rate,
            state: AtomicU8::new(PlayState::Stopped as u8),
            recording: AtomicBool::new(false),
            position: AtomicU64::new(0),
            pending_seek: AtomicU64::new(NO_SEEK),
            play_start: AtomicU64::new(0),
            bpm: AtomicU64::new(120f64.to_bits()),
            meter: AtomicU64::new(0),
            loop_start: AtomicU64::new(0),
            loop_end: AtomicU64::new(0),
            loop_enabled: AtomicBool::new(false),
        };
        transport.apply_settings(settings);
        transport
    }

    /// Load tempo, meter and loop from a project.
    pub fn apply_settings(&self, settings: &TransportSettings) {
        self.set_tempo(settings.bpm);
        self.set_time_signature(settings.time_signature);
        self.set_loop(settings.loop_start, settings.loop_end, settings.loop_enabled);
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn state(&self) -> PlayState {
        PlayState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayState::Playing
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Current position, including a seek that has not been applied yet.
    pub fn position(&self) -> u64 {
        match self.pending_seek.load(Ordering::Acquire) {
            NO_SEEK => self.position.load(Ordering::Acquire),
            pos => pos,
        }
    }

    pub fn play(&self) {
        if self.state() != PlayState::Playing {
            self.play_start.store(self.position(), Ordering::Release);
            self.state.store(PlayState::Playing as u8, Ordering::Release);
        }
    }

    /// Halt at the current position.
    pub fn pause(&self) {
        if self.state() == PlayState::Playing {
            self.state.store(PlayState::Paused as u8, Ordering::Release);
        }
    }

    /// Halt and return to where playback started. Returns the position playback
    /// reached, which is where latched automation ends.
    pub fn stop(&self) -> u64 {
        let reached = self.position();
        if self.state() != PlayState::Stopped {
            self.state.store(PlayState::Stopped as u8, Ordering::Release);
            self.seek(self.play_start.load(Ordering::Acquire));
        }
        reached
    }

    pub fn seek(&self, position: u64) {
        let position = position.min(NO_SEEK - 1);
        self.pending_seek.store(position, Ordering::Release);
        if self.state() != PlayState::Playing {
            self.play_start.store(position, Ordering::Release);
        }
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    /// Stored clamped to a sane range. Returns the stored tempo.
    pub fn set_tempo(&self, bpm: f64) -> f64 {
        let bpm = clamp_bpm(bpm);
        self.bpm.store(bpm.to_bits(), Ordering::Release);
        bpm
    }

    pub fn tempo(&self) -> f64 {
        f64::from_bits(self.bpm.load(Ordering::Acquire))
    }

    pub fn set_time_signature(&self, ts: TimeSignature) {
        let packed = ((ts.numerator.max(1) as u64) << 8) | ts.denominator.max(1) as u64;
        self.meter.store(packed, Ordering::Release);
    }

    pub fn time_signature(&self) -> TimeSignature {
        let packed = self.meter.load(Ordering::Acquire);
        TimeSignature {
            numerator: (packed >> 8) as u8,
            denominator: (packed & 0xFF) as u8,
        }
    }

    /// An empty or inverted region disables looping.
    pub fn set_loop(&self, start: u64, end: u64, enabled: bool) {
        self.loop_start.store(start, Ordering::Release);
        self.loop_end.store(end, Ordering::Release);
        self.loop_enabled.store(enabled && end > start, Ordering::Release);
    }

    /// `(start, end, enabled)`
    pub fn loop_region(&self) -> (u64, u64, bool) {
        (
            self.loop_start.load(Ordering::Acquire),
            self.loop_end.load(Ordering::Acquire),
            self.loop_enabled.load(Ordering::Acquire),
        )
    }

    pub fn samples_per_beat(&self) -> f64 {
        self.sample_rate * 60.0 / self.tempo()
    }

    /// Convert quarter-note beats to samples at the current tempo.
    pub fn beats_to_samples(&self, beats: f64) -> u64 {
        (beats.max(0.0) * self.samples_per_beat()).round() as u64
    }

    /// Zero-based `(bar, beat)` of a position, in meter beats.
    pub fn bar_beat(&self, position: u64) -> (u64, f64) {
        let ts = self.time_signature();
        let beat_len = self.samples_per_beat() * 4.0 / ts.denominator as f64;
        let beats = position as f64 / beat_len;
        let per_bar = ts.numerator as f64;
        let bar = (beats / per_bar).floor();
        (bar as u64, beats - bar * per_bar)
    }

    /// Real-time side: apply pending requests and lay out the next `frames`.
    ///
    /// Returns `None` while not playing. The position is advanced past the
    /// quantum before returning.
    pub fn begin_quantum(&self, frames: usize) -> Option<QuantumPlan> {
        let seek = self.pending_seek.swap(NO_SEEK, Ordering::AcqRel);
        if seek != NO_SEEK {
            self.position.store(seek, Ordering::Release);
        }
        if !self.is_playing() {
            return None;
        }

        let position = self.position.load(Ordering::Acquire);
        let (start, end, enabled) = self.loop_region();
        // A playhead already past the loop end plays on.
        let looping = (enabled && position < end).then_some((start, end));
        let mut plan = QuantumPlan {
            position,
            frames,
            looping,
            wrapped: false,
        };

        let mut walk = plan.segments();
        while walk.next().is_some() {}
        plan.wrapped = walk.wraps > 0;
        self.position.store(walk.position, Ordering::Release);
        Some(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(48000.0, &TransportSettings::default())
    }

    #[test]
    fn stopped_transport_does_not_advance() {
        let t = transport();
        assert!(t.begin_quantum(256).is_none());
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn play_advances_per_quantum() {
        let t = transport();
        t.play();
        let plan = t.begin_quantum(256).unwrap();
        assert_eq!(plan.segments().collect::<Vec<_>>(), [Segment { position: 0, offset: 0, frames: 256 }]);
        t.begin_quantum(256);
        assert_eq!(t.position(), 512);
    }

    #[test]
    fn stop_returns_to_play_start_and_pause_holds() {
        let t = transport();
        t.seek(1000);
        t.play();
        t.begin_quantum(100);
        t.begin_quantum(100);
        t.pause();
        assert_eq!(t.position(), 1200);
        t.play();
        t.begin_quantum(100);
        assert_eq!(t.stop(), 1300);
        // stop returns to where the last play started
        assert_eq!(t.position(), 1200);
        assert!(t.begin_quantum(100).is_none());
        assert_eq!(t.position(), 1200);
    }

    #[test]
    fn seek_lands_on_quantum_boundary() {
        let t = transport();
        t.play();
        t.begin_quantum(64);
        t.seek(5000);
        assert_eq!(t.position(), 5000);
        let plan = t.begin_quantum(64).unwrap();
        assert_eq!(plan.segments().next().map(|s| s.position), Some(5000));
    }

    #[test]
    fn loop_wraps_inside_a_quantum() {
        let t = transport();
        t.set_loop(100, 300, true);
        t.seek(250);
        t.play();
        let plan = t.begin_quantum(128).unwrap();
        assert!(plan.wrapped);
        assert_eq!(
            plan.segments().collect::<Vec<_>>(),
            [
                Segment { position: 250, offset: 0, frames: 50 },
                Segment { position: 100, offset: 50, frames: 78 },
            ]
        );
        assert_eq!(t.position(), 178);
    }

    #[test]
    fn loop_ending_on_a_quantum_boundary_wraps() {
        let t = transport();
        t.set_loop(0, 256, true);
        t.play();
        let mut starts = Vec::new();
        for _ in 0..4 {
            let plan = t.begin_quantum(256).unwrap();
            assert!(plan.wrapped);
            starts.extend(plan.segments().map(|s| s.position));
        }
        assert_eq!(starts, [0, 0, 0, 0]);
        assert_eq!(t.position(), 0);

        t.stop();
        t.set_loop(0, 512, true);
        t.play();
        assert!(!t.begin_quantum(256).unwrap().wrapped);
        assert!(t.begin_quantum(256).unwrap().wrapped);
        assert_eq!(t.position(), 0);
    }

    #[test]
    fn loop_shorter_than_a_quantum_repeats_within_it() {
        let t = transport();
        t.set_loop(10, 40, true);
        t.seek(30);
        t.play();
        let plan = t.begin_quantum(100).unwrap();
        assert!(plan.wrapped);
        assert_eq!(
            plan.segments().collect::<Vec<_>>(),
            [
                Segment { position: 30, offset: 0, frames: 10 },
                Segment { position: 10, offset: 10, frames: 30 },
                Segment { position: 10, offset: 40, frames: 30 },
                Segment { position: 10, offset: 70, frames: 30 },
            ]
        );
        for seg in plan.segments() {
            assert!(seg.position + seg.frames as u64 <= 40);
        }
        assert_eq!(t.position(), 10);
    }

    #[test]
    fn playhead_past_the_loop_plays_on() {
        let t = transport();
        t.set_loop(0, 100, true);
        t.seek(500);
        t.play();
        let plan = t.begin_quantum(64).unwrap();
        assert!(!plan.wrapped);
        assert_eq!(t.position(), 564);
    }

    #[test]
    fn inverted_loop_is_disabled() {
        let t = transport();
        t.set_loop(500, 100, true);
        assert_eq!(t.loop_region(), (500, 100, false));
    }

    #[test]
    fn tempo_and_meter() {
        let t = transport();
        assert_eq!(t.set_tempo(5000.0), MAX_BPM);
        t.set_tempo(120.0);
        assert_eq!(t.beats_to_samples(1.0), 24000);
        t.set_time_signature(TimeSignature { numerator: 3, denominator: 4 });
        let (bar, beat) = t.bar_beat(24000 * 4);
        assert_eq!(bar, 1);
        assert!((beat - 1.0).abs() < 1e-9);
    }
}
