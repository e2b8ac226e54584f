//! Delay effect: stereo delay line with feedback.

use crate::parameter::{ParamSpec, value_at};

/// Longest delay time the line is sized for.
pub const MAX_DELAY_SECONDS: f64 = 2.0;

/// Echo level at which the tail is considered finished (-60 dB).
const TAIL_FLOOR: f64 = 1e-3;

/// A stereo delay effect with configurable time and feedback.
///
/// The delay buffer can hold up to `max_delay_seconds` of audio at the given
/// sample rate. The actual delay time can be changed dynamically. The output
/// is the echo signal only; the chain sums it over the dry input.
#[derive(Debug, Clone)]
pub struct Delay {
    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,

    /// Delay time in seconds.
    pub delay_time: f64,
    /// Feedback amount (0.0 = single echo, must stay below 1.0).
    pub feedback: f64,
}

impl Delay {
    pub const PARAMS: &'static [ParamSpec] = &[
        ParamSpec::new("time", 0.001, MAX_DELAY_SECONDS, 0.5, "s"),
        ParamSpec::new("feedback", 0.0, 0.95, 0.35, ""),
    ];

    /// Create a new delay effect.
    ///
    /// # Arguments
    /// - `sample_rate`: Audio sample rate in Hz.
    /// - `max_delay_seconds`: Maximum supported delay time.
    pub fn new(sample_rate: f64, max_delay_seconds: f64) -> Self {
        let buffer_size = (sample_rate * max_delay_seconds) as usize + 1;
        Self {
            buffer_l: vec![0.0; buffer_size],
            buffer_r: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            delay_time: 0.5,
            feedback: 0.35,
        }
    }

    /// Create a delay with specific parameters.
    pub fn with_params(sample_rate: f64, max_delay_seconds: f64, delay_time: f64, feedback: f64) -> Self {
        let mut d = Self::new(sample_rate, max_delay_seconds);
        d.delay_time = delay_time.clamp(0.0, max_delay_seconds);
        d.feedback = feedback.clamp(0.0, 0.99);
        d
    }

    pub fn set_params(&mut self, values: &[f64]) {
        let p = Self::PARAMS;
        self.delay_time = value_at(values, p, 0);
        self.feedback = value_at(values, p, 1).clamp(0.0, 0.99);
    }

    /// Time until the echoes fall below -60 dB.
    pub fn tail_seconds(values: &[f64]) -> f64 {
        let p = Self::PARAMS;
        let time = value_at(values, p, 0);
        let feedback = value_at(values, p, 1);
        if feedback <= TAIL_FLOOR {
            return time;
        }
        let repeats = (TAIL_FLOOR.ln() / feedback.ln()).ceil();
        time * (repeats + 1.0)
    }

    /// Process a stereo sample pair, returning the processed output.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let buffer_len = self.buffer_l.len();
        let delay_samples = (self.delay_time * self.sample_rate) as usize;
        let delay_samples = delay_samples.min(buffer_len - 1);

        // Calculate read position
        let read_pos = if self.write_pos >= delay_samples {
            self.write_pos - delay_samples
        } else {
            buffer_len - (delay_samples - self.write_pos)
        };

        // Read delayed samples
        let delayed_l = self.buffer_l[read_pos];
        let delayed_r = self.buffer_r[read_pos];

        // Write input + feedback to buffer
        let feedback_l = left + delayed_l * self.feedback as f32;
        let feedback_r = right + delayed_r * self.feedback as f32;
        self.buffer_l[self.write_pos] = feedback_l;
        self.buffer_r[self.write_pos] = feedback_r;

        // Advance write position
        self.write_pos = (self.write_pos + 1) % buffer_len;

        (delayed_l, delayed_r)
    }

    /// Replace a block of stereo audio with its echoes.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process(*l, *r);
        }
    }

    /// Clear the delay buffers.
    pub fn clear(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_tail_covers_feedback_decay() {
        // single echo
        assert!((Delay::tail_seconds(&[0.25, 0.0]) - 0.25).abs() < 1e-12);
        // 0.5^10 < 1e-3, so ten repeats plus the first echo
        assert!((Delay::tail_seconds(&[0.1, 0.5]) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_delay_outputs_delayed_signal() {
        let sample_rate = 44100.0;
        let delay_time = 0.01; // 10ms = 441 samples
        let mut delay = Delay::with_params(sample_rate, 1.0, delay_time, 0.0);
       
        // Send an impulse
        delay.process(1.0, 1.0);
       
        // Process samples until we hit the delay time
        let delay_samples = (delay_time * sample_rate) as usize;
        for _ in 1..delay_samples {
            let (out_l, _) = delay.process(0.0, 0.0);
            // Before delay time, output should be 0 (wet only)
            assert!(out_l.abs() < 1e-6);
        }
       
        // At delay time, the impulse should appear
        let (out_l, out_r) = delay.process(0.0, 0.0);
        assert!((out_l - 1.0).abs() < 1e-6);
        assert!((out_r - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_delay_feedback() {
        let sample_rate = 1000.0; // Simple sample rate for testing
        let delay_time = 0.01; // 10 samples
        let feedback = 0.5;
        let mut delay = Delay::with_params(sample_rate, 1.0, delay_time, feedback);
       
        // Send impulse
        delay.process(1.0, 1.0);
       
        // Wait for first echo
        let delay_samples = (delay_time * sample_rate) as usize;
        for _ in 1..delay_samples {
            delay.process(0.0, 0.0);
        }
       
        // First echo
        let (first_echo, _) = delay.process(0.0, 0.0);
        assert!((first_echo - 1.0).abs() < 1e-6);
       
        // Wait for second echo
        for _ in 1..delay_samples {
            delay.process(0.0, 0.0);
        }
       
        // Second echo should be attenuated by feedback
        let (second_echo, _) = delay.process(0.0, 0.0);
        assert!((second_echo - 0.5).abs() < 1e-6);
    }
}
