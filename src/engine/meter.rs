//! Peak meters and the latency report.

use std::sync::atomic::{AtomicU32, Ordering};

/// Per-node peak hold, written by the pipeline and read by the host.
///
/// Peaks are non-negative, and non-negative f32 bit patterns order the same
/// way as their values, so `fetch_max` on the raw bits is a float max.
#[derive(Debug, Default)]
pub struct Meter {
    left: AtomicU32,
    right: AtomicU32,
}

impl Meter {
    #[inline]
    pub fn update(&self, left: f32, right: f32) {
        self.left.fetch_max(left.abs().to_bits(), Ordering::Relaxed);
        self.right.fetch_max(right.abs().to_bits(), Ordering::Relaxed);
    }

    /// Peak since the previous read, then reset.
    pub fn take(&self) -> (f32, f32) {
        (
            f32::from_bits(self.left.swap(0, Ordering::Relaxed)),
            f32::from_bits(self.right.swap(0, Ordering::Relaxed)),
        )
    }
}

/// How far output trails the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Latency {
    /// One quantum of buffering.
    pub quantum_frames: usize,
    /// Worst lookahead along any path into the master bus.
    pub processing_frames: usize,
    pub sample_rate: f64,
}

impl Latency {
    pub fn total_frames(&self) -> usize {
        self.quantum_frames + self.processing_frames
    }

    pub fn seconds(&self) -> f64 {
        self.total_frames() as f64 / self.sample_rate
    }
}
