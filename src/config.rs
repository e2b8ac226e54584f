//! Engine-wide configuration.
//!
//! Everything here is fixed for the lifetime of an [`Engine`](crate::engine::Engine):
//! buffers and arenas are sized from it once at start-up.

use serde::{Deserialize, Serialize};

/// Volume at or below this level is treated as silence.
pub const SILENCE_DB: f64 = -96.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Frames per quantum (one real-time callback block).
    pub quantum_frames: usize,
    /// Upper bound on tracks + buses. Node buffers are preallocated to this.
    pub max_nodes: usize,
    /// Upper bound on live effect kernels.
    pub max_effects: usize,
    /// Lower clamp for volume and send levels. Values at this level are silent.
    pub min_volume_db: f64,
    /// Upper clamp for volume and send levels.
    pub max_volume_db: f64,
    /// Capacity of the real-time → host event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the automation write buffer.
    pub record_queue_capacity: usize,
    /// Longest offline render accepted, including tail.
    pub max_offline_seconds: f64,
    /// Extra tail rendered beyond the longest effect tail.
    pub tail_margin_seconds: f64,
    /// Apply a tanh soft clipper after the master strip.
    pub master_soft_clip: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            quantum_frames: 256,
            max_nodes: 128,
            max_effects: 512,
            min_volume_db: SILENCE_DB,
            max_volume_db: 12.0,
            event_queue_capacity: 1024,
            record_queue_capacity: 4096,
            max_offline_seconds: 3600.0,
            tail_margin_seconds: 0.1,
            master_soft_clip: false,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Clamp nonsensical values into a usable range.
    pub fn sanitized(mut self) -> Self {
        if !(self.sample_rate.is_finite() && self.sample_rate >= 8000.0) {
            log::warn!("sample rate {} out of range, using 48000", self.sample_rate);
            self.sample_rate = 48000.0;
        }
        self.quantum_frames = self.quantum_frames.clamp(16, 8192);
        self.max_nodes = self.max_nodes.max(2);
        self.max_effects = self.max_effects.max(1);
        if self.max_volume_db < self.min_volume_db {
            std::mem::swap(&mut self.max_volume_db, &mut self.min_volume_db);
        }
        self.event_queue_capacity = self.event_queue_capacity.max(16);
        self.record_queue_capacity = self.record_queue_capacity.max(16);
        self.tail_margin_seconds = self.tail_margin_seconds.max(0.0);
        self
    }

    /// Duration of one quantum in seconds.
    pub fn quantum_seconds(&self) -> f64 {
        self.quantum_frames as f64 / self.sample_rate
    }

    pub fn clamp_volume_db(&self, db: f64) -> f64 {
        if db.is_nan() {
            return self.min_volume_db;
        }
        db.clamp(self.min_volume_db, self.max_volume_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"sample_rate": 44100, "quantum_frames": 128}"#)
            .expect("config should parse");
        assert_eq!(config.sample_rate, 44100.0);
        assert_eq!(config.quantum_frames, 128);
        assert_eq!(config.max_nodes, EngineConfig::default().max_nodes);
    }

    #[test]
    fn sanitize_fixes_bad_values() {
        let config = EngineConfig {
            sample_rate: 0.0,
            quantum_frames: 1,
            min_volume_db: 6.0,
            max_volume_db: -6.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.quantum_frames, 16);
        assert!(config.min_volume_db < config.max_volume_db);
    }

    #[test]
    fn volume_clamps() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_volume_db(100.0), 12.0);
        assert_eq!(config.clamp_volume_db(-1000.0), SILENCE_DB);
        assert_eq!(config.clamp_volume_db(f64::NAN), SILENCE_DB);
    }
}
