//! Stereo audio buffer with a fixed capacity.
//!
//! Buffers are allocated once (at engine start or render start) and then only
//! cleared and resized within their capacity, so the real-time path never
//! touches the allocator.

#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    left: Vec<f32>,
    right: Vec<f32>,
    frames: usize,
}

impl StereoBuffer {
    /// Allocate a silent buffer holding up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            left: vec![0.0; capacity],
            right: vec![0.0; capacity],
            frames: capacity,
        }
    }

    /// Wrap existing channel data. Both channels are truncated to the shorter length.
    pub fn from_channels(mut left: Vec<f32>, mut right: Vec<f32>) -> Self {
        let frames = left.len().min(right.len());
        left.truncate(frames);
        right.truncate(frames);
        Self {
            left,
            right,
            frames,
        }
    }

    pub fn capacity(&self) -> usize {
        self.left.len()
    }

    /// Number of valid frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Zero the first `frames` samples and mark them valid.
    #[inline]
    pub fn clear(&mut self, frames: usize) {
        let n = frames.min(self.capacity());
        self.left[..n].fill(0.0);
        self.right[..n].fill(0.0);
        self.frames = n;
    }

    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity());
    }

    pub fn left(&self) -> &[f32] {
        &self.left[..self.frames]
    }

    pub fn right(&self) -> &[f32] {
        &self.right[..self.frames]
    }

    /// Mutable access to both channels at once.
    pub fn channels_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.left[..self.frames], &mut self.right[..self.frames])
    }

    /// Overwrite this buffer with `other`'s valid frames.
    #[inline]
    pub fn copy_from(&mut self, other: &StereoBuffer) {
        let n = other.frames.min(self.capacity());
        self.left[..n].copy_from_slice(&other.left[..n]);
        self.right[..n].copy_from_slice(&other.right[..n]);
        self.frames = n;
    }

    /// Add `other` into this buffer with a per-channel gain.
    #[inline]
    pub fn mix_from(&mut self, other: &StereoBuffer, gain_l: f32, gain_r: f32) {
        let n = self.frames.min(other.frames);
        for (dst, src) in self.left[..n].iter_mut().zip(&other.left[..n]) {
            *dst += src * gain_l;
        }
        for (dst, src) in self.right[..n].iter_mut().zip(&other.right[..n]) {
            *dst += src * gain_r;
        }
    }

    #[inline]
    pub fn apply_gain(&mut self, gain_l: f32, gain_r: f32) {
        for s in &mut self.left[..self.frames] {
            *s *= gain_l;
        }
        for s in &mut self.right[..self.frames] {
            *s *= gain_r;
        }
    }

    /// Per-channel absolute peak over the valid frames.
    pub fn peak(&self) -> (f32, f32) {
        let peak = |ch: &[f32]| ch.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        (peak(self.left()), peak(self.right()))
    }

    /// Consume the buffer, returning its valid frames per channel.
    pub fn into_channels(mut self) -> (Vec<f32>, Vec<f32>) {
        self.left.truncate(self.frames);
        self.right.truncate(self.frames);
        (self.left, self.right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_respects_capacity() {
        let mut buf = StereoBuffer::new(64);
        buf.clear(1000);
        assert_eq!(buf.frames(), 64);
        buf.clear(16);
        assert_eq!(buf.left().len(), 16);
    }

    #[test]
    fn mix_applies_gain() {
        let mut a = StereoBuffer::new(4);
        a.clear(4);
        let b = StereoBuffer::from_channels(vec![1.0; 4], vec![-1.0; 4]);
        a.mix_from(&b, 0.5, 0.25);
        a.mix_from(&b, 0.5, 0.25);
        assert!(a.left().iter().all(|&s| (s - 1.0).abs() < 1e-6));
        assert!(a.right().iter().all(|&s| (s + 0.5).abs() < 1e-6));
    }

    #[test]
    fn peak_tracks_each_channel() {
        let buf = StereoBuffer::from_channels(vec![0.1, -0.8, 0.3], vec![0.0, 0.2, -0.4]);
        let (l, r) = buf.peak();
        assert!((l - 0.8).abs() < 1e-6);
        assert!((r - 0.4).abs() < 1e-6);
    }
}
