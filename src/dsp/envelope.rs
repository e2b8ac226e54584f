//! ADSR envelope generator.

use serde::{Deserialize, Serialize};

/// Envelope shape. Times in seconds, sustain as a level in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Adsr {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.3,
        }
    }
}

impl Adsr {
    /// Clamp every field into a usable range.
    pub fn sanitized(self) -> Self {
        let time = |t: f64| if t.is_finite() { t.clamp(0.0, 30.0) } else { 0.0 };
        Self {
            attack: time(self.attack),
            decay: time(self.decay),
            sustain: if self.sustain.is_finite() {
                self.sustain.clamp(0.0, 1.0)
            } else {
                1.0
            },
            release: time(self.release),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Linear-segment envelope driven by gate on/off.
#[derive(Debug, Clone)]
pub struct Envelope {
    shape: Adsr,
    sample_rate: f64,
    stage: Stage,
    level: f64,
    /// Level at the start of the current segment.
    from: f64,
    /// Level at the end of the current segment.
    to: f64,
    length: usize,
    position: usize,
}

impl Envelope {
    pub fn new(shape: Adsr, sample_rate: f64) -> Self {
        Self {
            shape: shape.sanitized(),
            sample_rate,
            stage: Stage::Idle,
            level: 0.0,
            from: 0.0,
            to: 0.0,
            length: 0,
            position: 0,
        }
    }

    pub fn shape(&self) -> Adsr {
        self.shape
    }

    /// Note on. Retriggers from the current level so there is no click.
    pub fn gate_on(&mut self) {
        self.enter(Stage::Attack, self.shape.attack, 1.0);
    }

    /// Note off.
    pub fn gate_off(&mut self) {
        if self.stage != Stage::Idle {
            self.enter(Stage::Release, self.shape.release, 0.0);
        }
    }

    fn enter(&mut self, stage: Stage, seconds: f64, to: f64) {
        self.stage = stage;
        self.from = self.level;
        self.to = to;
        self.length = (seconds * self.sample_rate) as usize;
        self.position = 0;
    }

    /// Advance one sample and return the level.
    pub fn next_sample(&mut self) -> f64 {
        match self.stage {
            Stage::Idle => return 0.0,
            Stage::Sustain => return self.level,
            _ => {}
        }

        if self.position >= self.length {
            self.level = self.to;
            match self.stage {
                Stage::Attack => self.enter(Stage::Decay, self.shape.decay, self.shape.sustain),
                Stage::Decay => self.stage = Stage::Sustain,
                Stage::Release => self.stage = Stage::Idle,
                Stage::Idle | Stage::Sustain => {}
            }
        } else {
            let t = self.position as f64 / self.length as f64;
            self.level = self.from + (self.to - self.from) * t;
            self.position += 1;
        }
        self.level
    }

    /// Idle after release (or never triggered).
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(attack: f64, decay: f64, sustain: f64, release: f64) -> Adsr {
        Adsr {
            attack,
            decay,
            sustain,
            release,
        }
    }

    #[test]
    fn starts_idle() {
        let env = Envelope::new(Adsr::default(), 44100.0);
        assert!(env.is_finished());
    }

    #[test]
    fn attack_reaches_one() {
        let mut env = Envelope::new(shape(0.01, 0.1, 0.7, 0.3), 44100.0);
        env.gate_on();

        let max_level = (0..500).map(|_| env.next_sample()).fold(0.0, f64::max);
        assert!(
            (max_level - 1.0).abs() < 0.01,
            "Attack should reach ~1.0, got {max_level}"
        );
    }

    #[test]
    fn sustain_holds() {
        let mut env = Envelope::new(shape(0.001, 0.001, 0.6, 0.3), 44100.0);
        env.gate_on();
        for _ in 0..500 {
            env.next_sample();
        }
        let s = env.next_sample();
        assert!((s - 0.6).abs() < 0.01, "Should sustain at 0.6, got {s}");
    }

    #[test]
    fn release_to_zero() {
        let mut env = Envelope::new(shape(0.001, 0.001, 0.7, 0.01), 44100.0);
        env.gate_on();
        for _ in 0..500 {
            env.next_sample();
        }

        env.gate_off();
        for _ in 0..1000 {
            env.next_sample();
        }

        assert!(env.is_finished(), "Should be finished after release");
        assert_eq!(env.next_sample(), 0.0);
    }

    #[test]
    fn full_cycle_range() {
        let mut env = Envelope::new(shape(0.01, 0.05, 0.5, 0.1), 44100.0);
        env.gate_on();
        for _ in 0..10000 {
            let s = env.next_sample();
            assert!((0.0..=1.0).contains(&s), "Envelope out of range: {s}");
        }

        env.gate_off();
        for _ in 0..10000 {
            let s = env.next_sample();
            assert!((0.0..=1.0).contains(&s), "Envelope out of range after release: {s}");
        }

        assert!(env.is_finished());
    }

    #[test]
    fn sanitized_clamps_nonsense() {
        let s = shape(-1.0, f64::NAN, 3.0, 100.0).sanitized();
        assert_eq!(s.attack, 0.0);
        assert_eq!(s.decay, 0.0);
        assert_eq!(s.sustain, 1.0);
        assert_eq!(s.release, 30.0);
    }
}
