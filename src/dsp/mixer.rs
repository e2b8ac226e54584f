//! Mixing laws: gain conversion, panning, and the master soft clipper.

use crate::config::SILENCE_DB;
use std::f64::consts::FRAC_PI_4;

/// Convert decibels to linear gain. Anything at or below [`SILENCE_DB`] is silent.
#[inline]
pub fn db_to_gain(db: f64) -> f64 {
    if db <= SILENCE_DB {
        0.0
    } else {
        10.0_f64.powf(db / 20.0)
    }
}

/// Convert linear amplitude to decibels, floored at [`SILENCE_DB`].
#[inline]
pub fn gain_to_db(gain: f64) -> f64 {
    if gain <= 0.0 {
        SILENCE_DB
    } else {
        (20.0 * gain.log10()).max(SILENCE_DB)
    }
}

/// Constant-power balance for a stereo signal.
///
/// Unity on both sides at centre; the far side fades along a sine/cosine
/// curve while the near side is held at unity.
#[inline]
pub fn pan_gains(pan: f64) -> (f64, f64) {
    let pan = pan.clamp(-1.0, 1.0);
    let theta = (pan + 1.0) * FRAC_PI_4;
    let l = (std::f64::consts::SQRT_2 * theta.cos()).min(1.0);
    let r = (std::f64::consts::SQRT_2 * theta.sin()).min(1.0);
    (l.max(0.0), r.max(0.0))
}

/// Combined fader + pan gains for one channel strip.
#[inline]
pub fn strip_gains(volume_db: f64, pan: f64) -> (f32, f32) {
    let gain = db_to_gain(volume_db);
    let (l, r) = pan_gains(pan);
    ((gain * l) as f32, (gain * r) as f32)
}

/// Soft clipper using tanh to prevent harsh digital clipping.
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    x.tanh()
}

/// Root-mean-square over both channels.
pub fn rms(left: &[f32], right: &[f32]) -> f64 {
    let n = left.len() + right.len();
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = left
        .iter()
        .chain(right.iter())
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    (sum / n as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-12);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 1e-3);
        assert!((gain_to_db(db_to_gain(-12.5)) + 12.5).abs() < 1e-9);
        assert_eq!(db_to_gain(SILENCE_DB), 0.0);
        assert_eq!(gain_to_db(0.0), SILENCE_DB);
    }

    #[test]
    fn pan_centre_is_unity() {
        let (l, r) = pan_gains(0.0);
        assert!((l - 1.0).abs() < 1e-9);
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pan_hard_sides() {
        let (l, r) = pan_gains(-1.0);
        assert!((l - 1.0).abs() < 1e-9);
        assert!(r.abs() < 1e-9);
        let (l, r) = pan_gains(1.0);
        assert!(l.abs() < 1e-9);
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pan_out_of_range_clamps() {
        assert_eq!(pan_gains(5.0), pan_gains(1.0));
    }

    #[test]
    fn soft_clip_prevents_overflow() {
        assert!(soft_clip(100.0) <= 1.0);
        assert!(soft_clip(-100.0) >= -1.0);
    }

    #[test]
    fn rms_of_full_scale_square() {
        let l = vec![1.0, -1.0, 1.0, -1.0];
        let r = l.clone();
        assert!((rms(&l, &r) - 1.0).abs() < 1e-12);
    }
}
